// src/scene/component.rs
//! Component trait and per-node component storage.

use std::any::{Any, TypeId};

use glam::Mat4;

use crate::time::Time;

use super::NodeId;

/// Type-erasure helpers, implemented for every `'static` type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    #[inline]
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Behaviour attached to exactly one scene node, keyed by its concrete type.
pub trait Component: AsAny + Send + Sync {
    /// Called once per frame while the component is enabled.
    fn update(&mut self, _ctx: &ComponentContext<'_>, _time: &Time) {}
}

/// What a component sees of its node during [`Component::update`].
pub struct ComponentContext<'a> {
    pub node: NodeId,
    pub world: Mat4,
    pub(crate) siblings: &'a [ComponentSlot],
}

impl<'a> ComponentContext<'a> {
    /// Another component on the same node. The component being updated is not visible.
    pub fn sibling<T: Component>(&self) -> Option<&'a T> {
        find(self.siblings, TypeId::of::<T>())
            .and_then(|slot| slot.component.as_deref())
            .and_then(|c| c.as_any().downcast_ref::<T>())
    }
}

pub(crate) struct ComponentSlot {
    pub type_id: TypeId,
    pub name: &'static str,
    pub enabled: bool,
    /// `None` only while the component is being updated.
    pub component: Option<Box<dyn Component>>,
}

impl ComponentSlot {
    pub fn new<T: Component>(component: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
            enabled: true,
            component: Some(Box::new(component)),
        }
    }

    pub fn get<T: Component>(&self) -> Option<&T> {
        self.component.as_deref().and_then(|c| c.as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.component.as_deref_mut().and_then(|c| c.as_any_mut().downcast_mut::<T>())
    }
}

pub(crate) fn find(slots: &[ComponentSlot], type_id: TypeId) -> Option<&ComponentSlot> {
    slots.iter().find(|slot| slot.type_id == type_id)
}

/// `crate::scene::components::LightComponent` -> `LightComponent`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);
    impl Component for Counter {}

    #[test]
    fn test_slot_downcasts_by_type() {
        let mut slot = ComponentSlot::new(Counter(3));
        assert_eq!(slot.name, "Counter");
        assert_eq!(slot.get::<Counter>().map(|c| c.0), Some(3));
        slot.get_mut::<Counter>().unwrap().0 = 7;
        let boxed = slot.component.take().unwrap();
        let counter = boxed.into_any().downcast::<Counter>().unwrap();
        assert_eq!(counter.0, 7);
    }
}
