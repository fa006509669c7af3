// src/spatial/octree.rs
//! Adaptive octree over boundable scene objects.
//!
//! Objects are added to the root and only distributed by [`Octree::rebuild`], which
//! joins everything back to the root, recomputes the root box from the objects and
//! splits eagerly, depth-first, using a cost-model heuristic:
//!
//! ```text
//! depth          = round(0.4809 * ln(0.25993 * overlap * n))
//! max_objects    = round(n / 8^depth)
//! min_extents    = root_half_extents / 2^depth
//! ```
//!
//! A node splits only when it holds more than `max_objects` and every half-extent
//! axis is at least twice `min_extents`. Objects that straddle child boundaries stay
//! at the parent. Nodes live in an arena addressed by index (the root is index 0);
//! objects live in a slot table addressed by [`BoundableId`].

use std::collections::HashSet;
use std::hash::Hash;

use glam::Vec3;

use super::bounds::{Aabb, Frustum, Intersection};

/// Default proxy for the expected number of nodes a frustum overlaps.
pub const DEFAULT_OVERLAP_CONSTANT: f32 = 8.0;

/// Handle to an object registered in an [`Octree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundableId {
    index: u32,
    generation: u32,
}

/// Split parameters derived at the last rebuild.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplitParameters {
    pub depth: u32,
    pub max_objects: usize,
    pub min_extents: Vec3,
}

impl SplitParameters {
    /// Derives the heuristic from the object count and the root box.
    pub fn derive(object_count: usize, root_half_extents: Vec3, overlap_constant: f32) -> Self {
        if object_count == 0 {
            return Self {
                depth: 0,
                max_objects: 1,
                min_extents: root_half_extents,
            };
        }
        let n = object_count as f32;
        let raw_depth = (0.4809 * (0.25993 * overlap_constant * n).ln()).round();
        // ln() of a fraction goes negative for tiny trees; a negative depth means "don't split".
        let depth = raw_depth.max(0.0) as u32;
        let max_objects = (n / 8f32.powi(depth as i32)).round() as usize;
        let min_extents = root_half_extents / 2f32.powi(depth as i32);
        Self {
            depth,
            max_objects,
            min_extents,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OctreeStats {
    pub nodes: usize,
    pub objects: usize,
    pub tombstones: usize,
    pub max_depth: u32,
}

#[derive(Debug)]
struct Entry<T> {
    bounds: Aabb,
    owner: T,
    node: usize,
    generation: u32,
    alive: bool,
    vacant: bool,
}

#[derive(Debug)]
struct OctreeNode {
    bounds: Aabb,
    depth: u32,
    objects: Vec<u32>,
    children: Option<[usize; 8]>,
}

impl OctreeNode {
    fn leaf(bounds: Aabb, depth: u32) -> Self {
        Self {
            bounds,
            depth,
            objects: Vec::new(),
            children: None,
        }
    }
}

/// Spatial index answering frustum queries with the owners of visible objects.
#[derive(Debug)]
pub struct Octree<T> {
    nodes: Vec<OctreeNode>,
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    overlap_constant: f32,
    params: SplitParameters,
    dirty: bool,
    // False until the first object arrives after an empty rebuild.
    root_bounds_valid: bool,
}

impl<T: Copy + Eq + Hash> Default for Octree<T> {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAP_CONSTANT)
    }
}

// Child order: bit 0 = +x, bit 1 = +y, bit 2 = +z.
const CHILD_SIGNS: [Vec3; 8] = [
    Vec3::new(-1.0, -1.0, -1.0),
    Vec3::new(1.0, -1.0, -1.0),
    Vec3::new(-1.0, 1.0, -1.0),
    Vec3::new(1.0, 1.0, -1.0),
    Vec3::new(-1.0, -1.0, 1.0),
    Vec3::new(1.0, -1.0, 1.0),
    Vec3::new(-1.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, 1.0),
];

impl<T: Copy + Eq + Hash> Octree<T> {
    pub fn new(overlap_constant: f32) -> Self {
        Self {
            nodes: vec![OctreeNode::leaf(Aabb::ZERO, 0)],
            entries: Vec::new(),
            free: Vec::new(),
            overlap_constant,
            params: SplitParameters::derive(0, Vec3::ZERO, overlap_constant),
            dirty: false,
            root_bounds_valid: false,
        }
    }

    // ---------- mutation ----------

    /// Registers an object at the root. It is distributed at the next rebuild.
    pub fn add_boundable(&mut self, bounds: Aabb, owner: T) -> BoundableId {
        let root = &mut self.nodes[0];
        root.bounds = if self.root_bounds_valid {
            root.bounds.union(&bounds)
        } else {
            bounds
        };
        self.root_bounds_valid = true;

        let entry = Entry {
            bounds,
            owner,
            node: 0,
            generation: 0,
            alive: true,
            vacant: false,
        };
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.entries[index as usize];
                let generation = slot.generation.wrapping_add(1);
                *slot = Entry { generation, ..entry };
                index
            }
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            }
        };
        self.nodes[0].objects.push(index);
        self.dirty = true;
        BoundableId {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    /// Tombstones an object. Queries skip it from now on; the slot is reclaimed
    /// by the next rebuild. Returns `false` for stale handles.
    pub fn remove_boundable(&mut self, id: BoundableId) -> bool {
        match self.entry_mut(id) {
            Some(entry) => {
                entry.alive = false;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Replaces an object's bounds. If its node no longer contains the new box the
    /// object moves to the root, whose box grows to cover it.
    pub fn update_bounds(&mut self, id: BoundableId, bounds: Aabb) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        if entry.bounds == bounds {
            return true;
        }
        entry.bounds = bounds;
        let node = entry.node;
        self.dirty = true;

        if node != 0 && !self.nodes[node].bounds.contains(&bounds) {
            self.nodes[node].objects.retain(|&i| i != id.index);
            self.nodes[0].objects.push(id.index);
            self.entries[id.index as usize].node = 0;
        }
        let root = &mut self.nodes[0];
        if !root.bounds.contains(&bounds) {
            root.bounds = root.bounds.union(&bounds);
        }
        true
    }

    // ---------- rebuild ----------

    /// Re-indexes every live object: join, recompute bounds, derive split
    /// parameters, split.
    pub fn rebuild(&mut self) {
        let objects = self.join();
        let bounds = self.recompute_bounds(&objects);
        self.params = SplitParameters::derive(objects.len(), bounds.half_extents, self.overlap_constant);

        let count = objects.len();
        let root = &mut self.nodes[0];
        root.bounds = bounds;
        root.objects = objects;
        let params = self.params;
        self.split(0, &params);
        self.dirty = false;
        self.root_bounds_valid = count > 0;

        log::debug!(
            "octree rebuilt: {} objects, {} nodes, depth {}, max {} per node",
            count,
            self.nodes.len(),
            self.params.depth,
            self.params.max_objects
        );
    }

    /// Collects every live object back into one flat list, drops all children
    /// and reclaims tombstoned slots.
    fn join(&mut self) -> Vec<u32> {
        let mut objects = Vec::new();
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &mut self.nodes[index];
            objects.append(&mut node.objects);
            if let Some(children) = node.children {
                stack.extend(children.iter().rev());
            }
        }
        self.nodes.truncate(1);
        self.nodes[0].children = None;

        let mut live = Vec::with_capacity(objects.len());
        for index in objects {
            let entry = &mut self.entries[index as usize];
            if entry.alive {
                entry.node = 0;
                live.push(index);
            } else if !entry.vacant {
                entry.vacant = true;
                self.free.push(index);
            }
        }
        live
    }

    fn recompute_bounds(&self, objects: &[u32]) -> Aabb {
        let mut iter = objects.iter().map(|&i| self.entries[i as usize].bounds);
        match iter.next() {
            Some(first) => iter.fold(first, |acc, b| acc.union(&b)),
            None => Aabb::ZERO,
        }
    }

    fn split(&mut self, index: usize, params: &SplitParameters) {
        let node = &self.nodes[index];
        if node.objects.len() <= params.max_objects || node.depth >= params.depth {
            return;
        }
        // Degenerate boxes produce children identical to the parent.
        if node.bounds.half_extents.max_element() <= 0.0 {
            return;
        }
        if !node.bounds.half_extents.cmpge(params.min_extents * 2.0).all() {
            return;
        }

        let center = node.bounds.center;
        let child_half = node.bounds.half_extents * 0.5;
        let child_depth = node.depth + 1;
        let mut children = [0usize; 8];

        for (slot, sign) in CHILD_SIGNS.iter().enumerate() {
            let child_bounds = Aabb::new(center + *sign * child_half, child_half);
            let pending = std::mem::take(&mut self.nodes[index].objects);
            let (inside, rest): (Vec<u32>, Vec<u32>) = pending
                .into_iter()
                .partition(|&i| child_bounds.contains(&self.entries[i as usize].bounds));
            self.nodes[index].objects = rest;

            let child_index = self.nodes.len();
            for &i in &inside {
                self.entries[i as usize].node = child_index;
            }
            let mut child = OctreeNode::leaf(child_bounds, child_depth);
            child.objects = inside;
            self.nodes.push(child);
            children[slot] = child_index;

            self.split(child_index, params);
        }
        self.nodes[index].children = Some(children);
    }

    // ---------- queries ----------

    /// Owners of every live object intersecting `frustum`, each reported once.
    pub fn intersections(&self, frustum: &Frustum) -> Vec<T> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect(0, frustum, false, &mut seen, &mut out);
        out
    }

    fn collect(&self, index: usize, frustum: &Frustum, inside: bool, seen: &mut HashSet<T>, out: &mut Vec<T>) {
        let node = &self.nodes[index];
        let inside = inside
            || match frustum.classify(&node.bounds) {
                Intersection::Outside => return,
                Intersection::Inside => true,
                Intersection::Intersecting => false,
            };

        for &i in &node.objects {
            let entry = &self.entries[i as usize];
            if !entry.alive {
                continue;
            }
            if (inside || frustum.intersects(&entry.bounds)) && seen.insert(entry.owner) {
                out.push(entry.owner);
            }
        }
        if let Some(children) = node.children {
            for child in children {
                self.collect(child, frustum, inside, seen, out);
            }
        }
    }

    // ---------- inspection ----------

    #[inline]
    pub fn needs_rebuild(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn split_parameters(&self) -> SplitParameters {
        self.params
    }

    #[inline]
    pub fn root_bounds(&self) -> Aabb {
        self.nodes[0].bounds
    }

    pub fn bounds_of(&self, id: BoundableId) -> Option<Aabb> {
        self.entry(id).map(|e| e.bounds)
    }

    /// Arena index of the node holding `id`.
    pub fn node_of(&self, id: BoundableId) -> Option<usize> {
        self.entry(id).map(|e| e.node)
    }

    /// Bounds of an arena node.
    pub fn node_bounds(&self, node: usize) -> Option<Aabb> {
        self.nodes.get(node).map(|n| n.bounds)
    }

    pub fn stats(&self) -> OctreeStats {
        OctreeStats {
            nodes: self.nodes.len(),
            objects: self.entries.iter().filter(|e| e.alive).count(),
            tombstones: self.entries.iter().filter(|e| !e.alive && !e.vacant).count(),
            max_depth: self.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
        }
    }

    fn entry(&self, id: BoundableId) -> Option<&Entry<T>> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.alive && e.generation == id.generation)
    }

    fn entry_mut(&mut self, id: BoundableId) -> Option<&mut Entry<T>> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.alive && e.generation == id.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn boxed(x: f32, y: f32, z: f32) -> Aabb {
        Aabb::new(Vec3::new(x, y, z), Vec3::ONE)
    }

    /// How many times each object index appears across all nodes.
    fn placements<T>(tree: &Octree<T>) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        for node in &tree.nodes {
            for &i in &node.objects {
                *counts.entry(i).or_insert(0) += 1;
            }
        }
        counts
    }

    #[test]
    fn test_empty_rebuild_is_degenerate() {
        let mut tree: Octree<u32> = Octree::default();
        tree.rebuild();
        assert_eq!(tree.stats().nodes, 1);
        assert_eq!(tree.root_bounds(), Aabb::ZERO);
        assert_eq!(tree.split_parameters().max_objects, 1);
        let everything = Frustum::from_aabb(&Aabb::new(Vec3::ZERO, Vec3::splat(1e6)));
        assert!(tree.intersections(&everything).is_empty());
    }

    #[test]
    fn test_split_parameter_formula() {
        let params = SplitParameters::derive(3, Vec3::new(6.25, 6.0, 6.0), 8.0);
        assert_eq!(params.depth, 1);
        assert_eq!(params.max_objects, 0);
        assert_eq!(params.min_extents, Vec3::new(3.125, 3.0, 3.0));

        let params = SplitParameters::derive(1000, Vec3::splat(100.0), 8.0);
        // 0.4809 * ln(2079.44) = 3.674 -> 4
        assert_eq!(params.depth, 4);
        assert_eq!(params.max_objects, 0);
        assert_eq!(params.min_extents, Vec3::splat(6.25));

        let params = SplitParameters::derive(1, Vec3::ONE, 8.0);
        assert_eq!(params.depth, 0);
        assert_eq!(params.max_objects, 1);
    }

    #[test]
    fn test_close_objects_share_a_node() {
        let mut tree = Octree::default();
        let a = tree.add_boundable(boxed(0.0, 0.0, 0.0), "a");
        let b = tree.add_boundable(boxed(10.0, 10.0, 10.0), "b");
        let c = tree.add_boundable(boxed(10.5, 10.0, 10.0), "c");
        tree.rebuild();

        assert_eq!(tree.root_bounds().min(), Vec3::splat(-1.0));
        assert_eq!(tree.root_bounds().max(), Vec3::new(11.5, 11.0, 11.0));
        assert_eq!(tree.node_of(b), tree.node_of(c));
        assert_ne!(tree.node_of(a), tree.node_of(b));
        assert_ne!(tree.node_of(a), Some(0));

        let around = Frustum::from_aabb(&Aabb::new(Vec3::new(10.25, 10.0, 10.0), Vec3::splat(1.5)));
        let mut visible = tree.intersections(&around);
        visible.sort();
        assert_eq!(visible, vec!["b", "c"]);
    }

    #[test]
    fn test_rebuild_places_each_object_once() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut tree = Octree::default();
        let mut ids = Vec::new();
        for owner in 0..500u32 {
            let center = Vec3::new(rng.gen_range(-100.0..100.0), rng.gen_range(-100.0..100.0), rng.gen_range(-20.0..20.0));
            let half = Vec3::splat(rng.gen_range(0.1..3.0));
            ids.push(tree.add_boundable(Aabb::new(center, half), owner));
        }
        tree.rebuild();
        // Rebuilding an already-split tree must be idempotent.
        tree.rebuild();

        let counts = placements(&tree);
        assert_eq!(counts.len(), 500);
        assert!(counts.values().all(|&c| c == 1));
        for id in &ids {
            let node = tree.node_of(*id).unwrap();
            // The root box is the union itself; children are checked by construction.
            if node != 0 {
                assert!(tree.node_bounds(node).unwrap().contains(&tree.bounds_of(*id).unwrap()));
            }
        }

        let everything = Frustum::from_aabb(&tree.root_bounds());
        let visible = tree.intersections(&everything);
        assert_eq!(visible.len(), 500);
        assert_eq!(visible.iter().collect::<HashSet<_>>().len(), 500);
    }

    #[test]
    fn test_leaves_respect_split_threshold() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut tree = Octree::default();
        for owner in 0..300u32 {
            let center = Vec3::new(rng.gen_range(0.0..64.0), rng.gen_range(0.0..64.0), rng.gen_range(0.0..64.0));
            tree.add_boundable(Aabb::new(center, Vec3::splat(0.25)), owner);
        }
        tree.rebuild();
        let params = tree.split_parameters();
        assert!(tree.stats().nodes > 1);
        for node in tree.nodes.iter().filter(|n| n.children.is_none()) {
            if node.objects.len() > params.max_objects {
                assert!(!node.bounds.half_extents.cmpge(params.min_extents * 2.0).all());
            }
        }
    }

    #[test]
    fn test_culling_never_reports_outside_objects() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tree = Octree::default();
        let mut boxes = Vec::new();
        for owner in 0..400usize {
            let b = Aabb::new(
                Vec3::new(rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0), rng.gen_range(-50.0..50.0)),
                Vec3::splat(rng.gen_range(0.1..2.0)),
            );
            boxes.push(b);
            tree.add_boundable(b, owner);
        }
        tree.rebuild();

        let region = Aabb::new(Vec3::new(10.0, -5.0, 0.0), Vec3::new(15.0, 20.0, 12.0));
        let frustum = Frustum::from_aabb(&region);
        let visible: HashSet<usize> = tree.intersections(&frustum).into_iter().collect();
        for (owner, b) in boxes.iter().enumerate() {
            if region.contains(b) {
                assert!(visible.contains(&owner), "inside object {owner} missing");
            }
            if !region.intersects(b) {
                assert!(!visible.contains(&owner), "outside object {owner} reported");
            }
        }
    }

    #[test]
    fn test_shared_owner_reported_once() {
        let mut tree = Octree::default();
        tree.add_boundable(boxed(0.0, 0.0, 0.0), 42u32);
        tree.add_boundable(boxed(30.0, 0.0, 0.0), 42u32);
        tree.add_boundable(boxed(60.0, 0.0, 0.0), 7u32);
        tree.rebuild();
        let everything = Frustum::from_aabb(&tree.root_bounds());
        let mut visible = tree.intersections(&everything);
        visible.sort();
        assert_eq!(visible, vec![7, 42]);
    }

    #[test]
    fn test_removal_is_deferred_to_rebuild() {
        let mut tree = Octree::default();
        let keep = tree.add_boundable(boxed(0.0, 0.0, 0.0), 1u32);
        let gone = tree.add_boundable(boxed(5.0, 0.0, 0.0), 2u32);
        tree.rebuild();

        assert!(tree.remove_boundable(gone));
        assert!(!tree.remove_boundable(gone));
        assert!(tree.needs_rebuild());
        assert_eq!(tree.stats().tombstones, 1);

        let everything = Frustum::from_aabb(&Aabb::new(Vec3::ZERO, Vec3::splat(100.0)));
        assert_eq!(tree.intersections(&everything), vec![1]);

        tree.rebuild();
        assert_eq!(tree.stats().tombstones, 0);
        assert!(tree.node_of(keep).is_some());

        // Reclaimed slot gets a new generation; the stale handle stays dead.
        let fresh = tree.add_boundable(boxed(1.0, 1.0, 1.0), 3u32);
        assert_ne!(fresh, gone);
        assert!(tree.bounds_of(gone).is_none());
        assert!(tree.bounds_of(fresh).is_some());
    }

    #[test]
    fn test_pending_objects_are_visible_before_rebuild() {
        let mut tree = Octree::default();
        tree.add_boundable(boxed(0.0, 0.0, 0.0), 1u32);
        tree.add_boundable(boxed(2.0, 0.0, 0.0), 2u32);
        tree.rebuild();
        tree.add_boundable(boxed(80.0, 0.0, 0.0), 3u32);

        assert!(tree.root_bounds().contains(&boxed(80.0, 0.0, 0.0)));
        let far = Frustum::from_aabb(&Aabb::new(Vec3::new(80.0, 0.0, 0.0), Vec3::splat(2.0)));
        assert_eq!(tree.intersections(&far), vec![3]);
    }

    #[test]
    fn test_moved_object_stays_queryable() {
        let mut tree = Octree::default();
        let mover = tree.add_boundable(boxed(0.0, 0.0, 0.0), 1u32);
        for i in 0..20 {
            tree.add_boundable(boxed(i as f32 * 4.0, 0.0, 0.0), 100 + i);
        }
        tree.rebuild();

        assert!(tree.update_bounds(mover, boxed(200.0, 50.0, 0.0)));
        assert_eq!(tree.node_of(mover), Some(0));
        let there = Frustum::from_aabb(&Aabb::new(Vec3::new(200.0, 50.0, 0.0), Vec3::splat(2.0)));
        assert_eq!(tree.intersections(&there), vec![1]);

        tree.rebuild();
        let node = tree.node_of(mover).unwrap();
        assert!(tree.node_bounds(node).unwrap().contains(&boxed(200.0, 50.0, 0.0)));
    }

    #[test]
    fn test_coincident_points_do_not_recurse() {
        let point = Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ZERO);
        let mut tree = Octree::default();
        tree.add_boundable(point, 1u32);
        tree.add_boundable(point, 2u32);
        tree.rebuild();

        assert_eq!(tree.stats().nodes, 1);
        let around = Frustum::from_aabb(&Aabb::new(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE));
        let mut visible = tree.intersections(&around);
        visible.sort();
        assert_eq!(visible, vec![1, 2]);

        for owner in 3..200u32 {
            tree.add_boundable(point, owner);
        }
        tree.rebuild();
        assert_eq!(tree.stats().objects, 199);
        assert!(tree.stats().max_depth <= tree.split_parameters().depth);
    }

    #[test]
    fn test_root_bounds_reset_after_emptying() {
        let mut tree = Octree::default();
        let id = tree.add_boundable(boxed(50.0, 0.0, 0.0), 1u32);
        tree.remove_boundable(id);
        tree.rebuild();
        assert_eq!(tree.root_bounds(), Aabb::ZERO);

        tree.add_boundable(boxed(-10.0, 0.0, 0.0), 2u32);
        assert_eq!(tree.root_bounds(), boxed(-10.0, 0.0, 0.0));
        tree.add_boundable(boxed(10.0, 0.0, 0.0), 3u32);
        assert_eq!(tree.root_bounds(), Aabb::new(Vec3::ZERO, Vec3::new(11.0, 1.0, 1.0)));
    }
}
