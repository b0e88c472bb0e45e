//! RegionSet Module
//!
//! The hierarchical grouping of regions that carries set-level polyphony
//! caps: `<global>` owns `<master>` sets, which own `<group>` sets, which
//! own regions. Sets and regions reference each other by stable ids, so
//! the parent/child graph stays an arena with index lookups.

use crate::region::RegionId;
use std::collections::HashMap;

/// Stable set identity within the engine.
pub type SetId = usize;

/// One node of the set hierarchy.
#[derive(Debug, Clone)]
pub struct RegionSet {
    pub id: SetId,
    pub parent: Option<SetId>,
    children: Vec<SetId>,
    regions: Vec<RegionId>,

    /// Voice cap across all regions of this set and its descendants
    pub polyphony: Option<usize>,
}

impl RegionSet {
    fn new(id: SetId, parent: Option<SetId>) -> Self {
        Self {
            id,
            parent,
            children: Vec::new(),
            regions: Vec::new(),
            polyphony: None,
        }
    }

    /// Regions directly attached to this set.
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    /// Child sets.
    pub fn children(&self) -> &[SetId] {
        &self.children
    }
}

/// The arena of region sets. The root set (id 0) represents `<global>`.
#[derive(Debug, Clone)]
pub struct RegionSetTree {
    sets: Vec<RegionSet>,
}

impl RegionSetTree {
    /// Creates a tree holding only the root set.
    pub fn new() -> Self {
        Self {
            sets: vec![RegionSet::new(0, None)],
        }
    }

    /// The root set id.
    pub fn root(&self) -> SetId {
        0
    }

    /// Adds a child set and returns its id.
    pub fn add_set(&mut self, parent: SetId) -> SetId {
        let id = self.sets.len();
        self.sets.push(RegionSet::new(id, Some(parent)));
        self.sets[parent].children.push(id);
        id
    }

    /// Attaches a region to a set.
    pub fn add_region(&mut self, set: SetId, region: RegionId) {
        self.sets[set].regions.push(region);
    }

    /// Gets a set by id.
    pub fn get(&self, id: SetId) -> &RegionSet {
        &self.sets[id]
    }

    /// Gets a mutable set by id.
    pub fn get_mut(&mut self, id: SetId) -> &mut RegionSet {
        &mut self.sets[id]
    }

    /// Number of sets.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// True when only the root exists and it is empty.
    pub fn is_empty(&self) -> bool {
        self.sets.len() == 1 && self.sets[0].regions.is_empty()
    }

    /// Walks from a set up through its parents, root last.
    pub fn for_each_parent(&self, set: SetId, mut f: impl FnMut(&RegionSet)) {
        let mut current = Some(set);
        while let Some(id) = current {
            let node = &self.sets[id];
            f(node);
            current = node.parent;
        }
    }

    /// All regions of a set, including its descendants'.
    pub fn regions_recursive(&self, set: SetId) -> Vec<RegionId> {
        let mut result = Vec::new();
        let mut stack = vec![set];
        while let Some(id) = stack.pop() {
            let node = &self.sets[id];
            result.extend_from_slice(&node.regions);
            stack.extend_from_slice(&node.children);
        }
        result
    }

    /// Clears everything back to a lone empty root.
    pub fn clear(&mut self) {
        self.sets.clear();
        self.sets.push(RegionSet::new(0, None));
    }
}

impl Default for RegionSetTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine-wide polyphony caps for `group=` ids.
#[derive(Debug, Clone, Default)]
pub struct PolyphonyGroups {
    caps: HashMap<u64, usize>,
}

impl PolyphonyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cap for a group id.
    pub fn set_polyphony(&mut self, group: u64, cap: usize) {
        self.caps.insert(group, cap.max(1));
    }

    /// The cap for a group, if any.
    pub fn polyphony(&self, group: u64) -> Option<usize> {
        self.caps.get(&group).copied()
    }

    /// Drops all caps.
    pub fn clear(&mut self) {
        self.caps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_starts_with_root() {
        let tree = RegionSetTree::new();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get(tree.root()).parent, None);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_hierarchy_construction() {
        let mut tree = RegionSetTree::new();
        let master = tree.add_set(tree.root());
        let group = tree.add_set(master);
        tree.add_region(group, 7);

        assert_eq!(tree.get(group).parent, Some(master));
        assert_eq!(tree.get(master).parent, Some(tree.root()));
        assert_eq!(tree.get(group).regions(), &[7]);
        assert_eq!(tree.get(tree.root()).children(), &[master]);
    }

    #[test]
    fn test_parent_walk_order() {
        let mut tree = RegionSetTree::new();
        let master = tree.add_set(tree.root());
        let group = tree.add_set(master);

        let mut visited = Vec::new();
        tree.for_each_parent(group, |set| visited.push(set.id));
        assert_eq!(visited, vec![group, master, tree.root()]);
    }

    #[test]
    fn test_regions_recursive() {
        let mut tree = RegionSetTree::new();
        let master = tree.add_set(tree.root());
        let group_a = tree.add_set(master);
        let group_b = tree.add_set(master);
        tree.add_region(group_a, 1);
        tree.add_region(group_b, 2);
        tree.add_region(master, 3);

        let mut regions = tree.regions_recursive(master);
        regions.sort();
        assert_eq!(regions, vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_resets_to_root() {
        let mut tree = RegionSetTree::new();
        let master = tree.add_set(tree.root());
        tree.add_region(master, 0);
        tree.clear();
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_group_polyphony_caps() {
        let mut groups = PolyphonyGroups::new();
        assert_eq!(groups.polyphony(1), None);

        groups.set_polyphony(1, 4);
        assert_eq!(groups.polyphony(1), Some(4));

        // A zero cap clamps to one voice
        groups.set_polyphony(2, 0);
        assert_eq!(groups.polyphony(2), Some(1));

        groups.clear();
        assert_eq!(groups.polyphony(1), None);
    }
}
