// src/scene/mod.rs
//! Scene graph: an arena of named nodes, each holding typed components.
//!
//! Nodes are addressed by [`NodeId`] (slot index + generation) so handles to
//! destroyed nodes are detected instead of aliasing new ones. The scene owns
//! the octree used for culling; volume components register their world boxes
//! in it during [`Scene::update`].

pub mod component;
pub mod components;

use std::any::TypeId;
use std::fmt;

use glam::Mat4;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::spatial::{Frustum, Octree, DEFAULT_OVERLAP_CONSTANT};
use crate::time::Time;

pub use component::{AsAny, Component, ComponentContext};
pub use components::{
    CameraComponent, LightComponent, MeshRendererComponent, RenderTarget, TransformComponent, VolumeComponent,
};

use component::{short_type_name, ComponentSlot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// When the scene re-indexes its octree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPolicy {
    /// At the end of every update that changed the index.
    #[default]
    OnDemand,
    /// Only through [`Scene::rebuild_spatial_index`].
    Manual,
}

pub struct SceneNode {
    name: String,
    tags: Vec<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    components: Vec<ComponentSlot>,
    world: Mat4,
}

impl SceneNode {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            tags: Vec::new(),
            parent,
            children: Vec::new(),
            components: Vec::new(),
            world: Mat4::IDENTITY,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// World matrix as of the last update.
    #[inline]
    pub fn world(&self) -> Mat4 {
        self.world
    }

    /// Type names of the attached components.
    pub fn component_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.components.iter().map(|slot| slot.name)
    }

    fn slot<T: Component>(&self) -> Option<&ComponentSlot> {
        component::find(&self.components, TypeId::of::<T>())
    }

    fn slot_mut<T: Component>(&mut self) -> Option<&mut ComponentSlot> {
        let type_id = TypeId::of::<T>();
        self.components.iter_mut().find(|slot| slot.type_id == type_id)
    }
}

struct NodeSlot {
    generation: u32,
    node: Option<SceneNode>,
}

pub struct Scene {
    slots: Vec<NodeSlot>,
    free: Vec<u32>,
    root: NodeId,
    octree: Octree<NodeId>,
    policy: RebuildPolicy,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAP_CONSTANT, RebuildPolicy::OnDemand)
    }
}

impl Scene {
    pub fn new(overlap_constant: f32, policy: RebuildPolicy) -> Self {
        Self {
            slots: vec![NodeSlot {
                generation: 0,
                node: Some(SceneNode::new("root".into(), None)),
            }],
            free: Vec::new(),
            root: NodeId { index: 0, generation: 0 },
            octree: Octree::new(overlap_constant),
            policy,
        }
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    #[inline]
    pub fn octree(&self) -> &Octree<NodeId> {
        &self.octree
    }

    #[inline]
    pub fn policy(&self) -> RebuildPolicy {
        self.policy
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    fn expect_node(&self, id: NodeId) -> Result<&SceneNode> {
        self.node(id).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    fn expect_node_mut(&mut self, id: NodeId) -> Result<&mut SceneNode> {
        self.node_mut(id).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    // ---------- hierarchy ----------

    pub fn create_node(&mut self, name: impl Into<String>, parent: NodeId) -> Result<NodeId> {
        self.expect_node(parent)?;
        let node = SceneNode::new(name.into(), Some(parent));
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(NodeSlot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.expect_node_mut(parent)?.children.push(id);
        Ok(id)
    }

    /// Destroys a node and its whole subtree. Their volumes leave the octree.
    pub fn destroy_node(&mut self, id: NodeId) -> Result<()> {
        if id == self.root {
            crate::bail!("the scene root cannot be destroyed");
        }
        let parent = self.expect_node(id)?.parent;
        if let Some(parent) = parent.and_then(|p| self.node_mut(p)) {
            parent.children.retain(|&child| child != id);
        }

        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let slot = &mut self.slots[current.index as usize];
            let Some(node) = slot.node.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(current.index);
            for volume in node.components.iter().filter_map(|s| s.get::<VolumeComponent>()) {
                if let Some(boundable) = volume.boundable {
                    self.octree.remove_boundable(boundable);
                }
            }
            stack.extend(node.children);
        }
        Ok(())
    }

    /// Moves `id` under `parent`. Reparenting under a descendant is rejected.
    pub fn set_parent(&mut self, id: NodeId, parent: NodeId) -> Result<()> {
        if id == self.root {
            crate::bail!("the scene root cannot be reparented");
        }
        self.expect_node(parent)?;
        let old_parent = self.expect_node(id)?.parent;

        let mut cursor = Some(parent);
        while let Some(current) = cursor {
            if current == id {
                crate::bail!("cannot parent node {} under its own descendant {}", id, parent);
            }
            cursor = self.node(current).and_then(|n| n.parent);
        }

        if let Some(old) = old_parent.and_then(|p| self.node_mut(p)) {
            old.children.retain(|&child| child != id);
        }
        self.expect_node_mut(parent)?.children.push(id);
        self.expect_node_mut(id)?.parent = Some(parent);
        Ok(())
    }

    pub fn add_tag(&mut self, id: NodeId, tag: impl Into<String>) -> Result<()> {
        let tag = tag.into();
        let node = self.expect_node_mut(id)?;
        if !node.tags.contains(&tag) {
            node.tags.push(tag);
        }
        Ok(())
    }

    /// First node (depth-first from the root) with the given name.
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.depth_first()
            .into_iter()
            .find(|&id| self.node(id).is_some_and(|n| n.name == name))
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<NodeId> {
        self.depth_first()
            .into_iter()
            .filter(|&id| self.node(id).is_some_and(|n| n.tags.iter().any(|t| t == tag)))
            .collect()
    }

    /// Live nodes, parents before children.
    pub fn depth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            order.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
        order
    }

    // ---------- components ----------

    /// Attaches a component. One component per type per node.
    pub fn add_component<T: Component>(&mut self, id: NodeId, component: T) -> Result<()> {
        let node = self.expect_node_mut(id)?;
        if node.slot::<T>().is_some() {
            return Err(Error::DuplicateComponent {
                node: id.to_string(),
                component: short_type_name::<T>(),
            });
        }
        node.components.push(ComponentSlot::new(component));
        Ok(())
    }

    pub fn component<T: Component>(&self, id: NodeId) -> Option<&T> {
        self.node(id)?.slot::<T>()?.get::<T>()
    }

    pub fn component_mut<T: Component>(&mut self, id: NodeId) -> Option<&mut T> {
        self.node_mut(id)?.slot_mut::<T>()?.get_mut::<T>()
    }

    /// Whether `T` is attached and enabled on `id`.
    pub fn component_enabled<T: Component>(&self, id: NodeId) -> bool {
        self.node(id).and_then(|n| n.slot::<T>()).is_some_and(|slot| slot.enabled)
    }

    /// Detaches and returns a component. A removed volume leaves the octree.
    pub fn remove_component<T: Component>(&mut self, id: NodeId) -> Result<Option<T>> {
        let node = self.expect_node_mut(id)?;
        let type_id = TypeId::of::<T>();
        let Some(position) = node.components.iter().position(|slot| slot.type_id == type_id) else {
            return Ok(None);
        };
        let slot = node.components.remove(position);
        let Some(component) = slot.component else {
            return Ok(None);
        };
        let component = match component.into_any().downcast::<T>() {
            Ok(component) => *component,
            Err(_) => return Ok(None),
        };
        if let Some(volume) = (&component as &dyn std::any::Any).downcast_ref::<VolumeComponent>() {
            if let Some(boundable) = volume.boundable {
                self.octree.remove_boundable(boundable);
            }
        }
        Ok(Some(component))
    }

    pub fn set_component_enabled<T: Component>(&mut self, id: NodeId, enabled: bool) -> Result<()> {
        let node = self.expect_node_mut(id)?;
        match node.slot_mut::<T>() {
            Some(slot) => {
                slot.enabled = enabled;
                Ok(())
            }
            None => Err(Error::MissingComponent {
                node: id.to_string(),
                component: short_type_name::<T>(),
            }),
        }
    }

    /// Live nodes carrying an enabled `T`, depth-first.
    pub fn nodes_with<T: Component>(&self) -> Vec<NodeId> {
        self.depth_first()
            .into_iter()
            .filter(|&id| self.component_enabled::<T>(id))
            .collect()
    }

    // ---------- frame ----------

    /// World transforms, component updates, volume sync, then (per policy) an
    /// octree rebuild.
    pub fn update(&mut self, time: &Time) {
        let _span = tracing::debug_span!("scene_update", frame = time.frame()).entered();
        let order = self.depth_first();
        self.update_transforms(&order);
        self.update_components(&order, time);
        self.sync_volumes(&order);
        if self.policy == RebuildPolicy::OnDemand && self.octree.needs_rebuild() {
            self.octree.rebuild();
        }
    }

    fn update_transforms(&mut self, order: &[NodeId]) {
        for &id in order {
            let parent_world = self
                .node(id)
                .and_then(|n| n.parent)
                .and_then(|p| self.node(p))
                .map_or(Mat4::IDENTITY, |p| p.world);
            let Some(node) = self.node_mut(id) else {
                continue;
            };
            let enabled = node.slot::<TransformComponent>().is_some_and(|s| s.enabled);
            node.world = match node.slot_mut::<TransformComponent>().and_then(|s| s.get_mut::<TransformComponent>()) {
                Some(transform) if enabled => {
                    transform.world = parent_world * transform.local_matrix();
                    transform.world
                }
                _ => parent_world,
            };
        }
    }

    fn update_components(&mut self, order: &[NodeId], time: &Time) {
        for &id in order {
            let Some(node) = self.node_mut(id) else {
                continue;
            };
            for i in 0..node.components.len() {
                if !node.components[i].enabled {
                    continue;
                }
                let Some(mut component) = node.components[i].component.take() else {
                    continue;
                };
                let ctx = ComponentContext {
                    node: id,
                    world: node.world,
                    siblings: &node.components,
                };
                component.update(&ctx, time);
                node.components[i].component = Some(component);
            }
        }
    }

    fn sync_volumes(&mut self, order: &[NodeId]) {
        let octree = &mut self.octree;
        for &id in order {
            let Some(node) = self.slots[id.index as usize].node.as_mut() else {
                continue;
            };
            let world = node.world;
            let type_id = TypeId::of::<VolumeComponent>();
            let Some(slot) = node.components.iter_mut().find(|s| s.type_id == type_id) else {
                continue;
            };
            let enabled = slot.enabled;
            let Some(volume) = slot.get_mut::<VolumeComponent>() else {
                continue;
            };

            if !enabled {
                if let Some(boundable) = volume.boundable.take() {
                    octree.remove_boundable(boundable);
                }
                continue;
            }
            volume.world = volume.local.transformed(&world);
            match volume.boundable {
                Some(boundable) if octree.update_bounds(boundable, volume.world) => {}
                _ => volume.boundable = Some(octree.add_boundable(volume.world, id)),
            }
        }
    }

    /// Re-indexes the octree regardless of policy.
    pub fn rebuild_spatial_index(&mut self) {
        self.octree.rebuild();
    }

    /// Distinct live nodes whose volumes intersect the frustum.
    pub fn visible_nodes(&self, frustum: &Frustum) -> Vec<NodeId> {
        self.octree
            .intersections(frustum)
            .into_iter()
            .filter(|&id| self.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::Aabb;
    use glam::Vec3;

    #[derive(Default)]
    struct Spin {
        ticks: u32,
        saw_transform: bool,
    }

    impl Component for Spin {
        fn update(&mut self, ctx: &ComponentContext<'_>, _time: &Time) {
            self.ticks += 1;
            self.saw_transform = ctx.sibling::<TransformComponent>().is_some();
        }
    }

    #[test]
    fn test_hierarchy_and_lookup() {
        let mut scene = Scene::default();
        let root = scene.root();
        let a = scene.create_node("a", root).unwrap();
        let b = scene.create_node("b", a).unwrap();
        scene.add_tag(b, "enemy").unwrap();

        assert_eq!(scene.find_by_name("b"), Some(b));
        assert_eq!(scene.find_by_tag("enemy"), vec![b]);
        assert_eq!(scene.node(a).unwrap().children(), &[b]);
        assert_eq!(scene.depth_first(), vec![root, a, b]);

        // Cycles are rejected.
        assert!(scene.set_parent(a, b).is_err());
        scene.set_parent(b, root).unwrap();
        assert!(scene.node(a).unwrap().children().is_empty());
        assert_eq!(scene.node(b).unwrap().parent(), Some(root));
    }

    #[test]
    fn test_destroy_is_recursive_and_invalidates_handles() {
        let mut scene = Scene::default();
        let a = scene.create_node("a", scene.root()).unwrap();
        let b = scene.create_node("b", a).unwrap();
        scene.destroy_node(a).unwrap();
        assert!(!scene.contains(a));
        assert!(!scene.contains(b));
        assert_eq!(scene.node_count(), 1);

        // Slot reuse does not revive stale handles.
        let c = scene.create_node("c", scene.root()).unwrap();
        assert!(scene.contains(c));
        assert!(!scene.contains(a) && !scene.contains(b));
        assert!(matches!(scene.add_component(a, Spin::default()), Err(Error::NodeNotFound(_))));
        assert!(scene.destroy_node(scene.root()).is_err());
    }

    #[test]
    fn test_components_are_unique_per_type() {
        let mut scene = Scene::default();
        let a = scene.create_node("a", scene.root()).unwrap();
        scene.add_component(a, Spin::default()).unwrap();
        let err = scene.add_component(a, Spin::default()).unwrap_err();
        assert!(matches!(err, Error::DuplicateComponent { component: "Spin", .. }));

        scene.component_mut::<Spin>(a).unwrap().ticks = 5;
        assert_eq!(scene.component::<Spin>(a).unwrap().ticks, 5);
        assert_eq!(scene.node(a).unwrap().component_names().collect::<Vec<_>>(), vec!["Spin"]);
        let removed = scene.remove_component::<Spin>(a).unwrap().unwrap();
        assert_eq!(removed.ticks, 5);
        assert!(scene.component::<Spin>(a).is_none());
        assert!(scene.set_component_enabled::<Spin>(a, false).is_err());
    }

    #[test]
    fn test_update_runs_enabled_components_with_siblings() {
        let mut scene = Scene::default();
        let a = scene.create_node("a", scene.root()).unwrap();
        scene.add_component(a, TransformComponent::identity()).unwrap();
        scene.add_component(a, Spin::default()).unwrap();

        scene.update(&Time::new(0.016, 0.016, 1));
        let spin = scene.component::<Spin>(a).unwrap();
        assert_eq!(spin.ticks, 1);
        assert!(spin.saw_transform);

        scene.set_component_enabled::<Spin>(a, false).unwrap();
        scene.update(&Time::new(0.016, 0.032, 2));
        assert_eq!(scene.component::<Spin>(a).unwrap().ticks, 1);
    }

    #[test]
    fn test_world_transforms_compose() {
        let mut scene = Scene::default();
        let parent = scene.create_node("parent", scene.root()).unwrap();
        let child = scene.create_node("child", parent).unwrap();
        let light = scene.create_node("light", child).unwrap();
        scene
            .add_component(parent, TransformComponent::from_translation(Vec3::new(10.0, 0.0, 0.0)))
            .unwrap();
        scene
            .add_component(child, TransformComponent::from_translation(Vec3::new(0.0, 5.0, 0.0)))
            .unwrap();
        scene.add_component(light, LightComponent::new(Vec3::ONE, 1.0, 10.0)).unwrap();

        scene.update(&Time::default());
        let world = scene.component::<TransformComponent>(child).unwrap().world_matrix();
        assert_eq!(world.w_axis.truncate(), Vec3::new(10.0, 5.0, 0.0));
        // No transform of its own: the light inherits its parent's world matrix.
        assert_eq!(scene.component::<LightComponent>(light).unwrap().position(), Vec3::new(10.0, 5.0, 0.0));
    }

    fn spawn_box(scene: &mut Scene, name: &str, at: Vec3) -> NodeId {
        let id = scene.create_node(name, scene.root()).unwrap();
        scene.add_component(id, TransformComponent::from_translation(at)).unwrap();
        scene.add_component(id, VolumeComponent::new(Aabb::new(Vec3::ZERO, Vec3::ONE))).unwrap();
        id
    }

    #[test]
    fn test_volumes_feed_the_octree() {
        let mut scene = Scene::default();
        let near = spawn_box(&mut scene, "near", Vec3::ZERO);
        let far = spawn_box(&mut scene, "far", Vec3::new(50.0, 0.0, 0.0));
        scene.update(&Time::default());
        assert!(!scene.octree().needs_rebuild());
        assert_eq!(scene.octree().stats().objects, 2);

        let around_near = Frustum::from_aabb(&Aabb::new(Vec3::ZERO, Vec3::splat(3.0)));
        assert_eq!(scene.visible_nodes(&around_near), vec![near]);

        // Moving a node moves its volume.
        scene.component_mut::<TransformComponent>(far).unwrap().translation = Vec3::new(1.0, 0.0, 0.0);
        scene.update(&Time::default());
        let mut visible = scene.visible_nodes(&around_near);
        visible.sort();
        assert_eq!(visible, vec![near, far]);

        // Disabled or destroyed volumes drop out.
        scene.set_component_enabled::<VolumeComponent>(far, false).unwrap();
        scene.update(&Time::default());
        assert_eq!(scene.visible_nodes(&around_near), vec![near]);
        scene.destroy_node(near).unwrap();
        assert!(scene.visible_nodes(&around_near).is_empty());
    }

    #[test]
    fn test_manual_policy_defers_rebuild() {
        let mut scene = Scene::new(DEFAULT_OVERLAP_CONSTANT, RebuildPolicy::Manual);
        spawn_box(&mut scene, "a", Vec3::ZERO);
        scene.update(&Time::default());
        assert!(scene.octree().needs_rebuild());
        scene.rebuild_spatial_index();
        assert!(!scene.octree().needs_rebuild());
    }
}
