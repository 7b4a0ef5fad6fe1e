//! Scene composition.
//!
//! A scene is an ordered list of draw nodes and nested scenes. There is
//! no duplicate or cycle detection; not building cycles is part of the
//! caller contract. Traversal is depth-first in insertion order and
//! mutates nothing beyond per-node render caches.

use std::cell::RefCell;
use std::rc::Rc;

use crate::geometry::Bounds;
use crate::program::NodeRef;

/// Shared handle to a [`Scene`], for nesting scenes inside scenes.
pub type SceneRef = Rc<RefCell<Scene>>;

/// One entry in a scene.
pub enum SceneNode {
    Draw(NodeRef),
    Group(SceneRef),
}

impl From<NodeRef> for SceneNode {
    fn from(node: NodeRef) -> Self {
        SceneNode::Draw(node)
    }
}

impl From<SceneRef> for SceneNode {
    fn from(scene: SceneRef) -> Self {
        SceneNode::Group(scene)
    }
}

impl From<Scene> for SceneNode {
    fn from(scene: Scene) -> Self {
        SceneNode::Group(Rc::new(RefCell::new(scene)))
    }
}

/// An ordered composite of draw nodes.
#[derive(Default)]
pub struct Scene {
    nodes: Vec<SceneNode>,
}

impl Scene {
    pub fn new() -> Scene {
        Scene::default()
    }

    /// Appends a draw node or a nested scene.
    pub fn add(&mut self, node: impl Into<SceneNode>) {
        self.nodes.push(node.into());
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All draw nodes, depth-first in insertion order.
    pub fn flatten(&self) -> Vec<NodeRef> {
        let mut out = Vec::new();
        self.collect(&mut out);
        out
    }

    fn collect(&self, out: &mut Vec<NodeRef>) {
        for node in &self.nodes {
            match node {
                SceneNode::Draw(node) => out.push(node.clone()),
                SceneNode::Group(scene) => scene.borrow().collect(out),
            }
        }
    }

    /// Union of the transformed bounds of every node that has bounds.
    pub fn bounds(&self) -> Option<Bounds> {
        let mut union: Option<Bounds> = None;
        for node in self.flatten() {
            let node = node.borrow();
            if let Some(bounds) = node.bounds() {
                let bounds = bounds.transformed(&node.transform);
                union = Some(match union {
                    Some(u) => u.union(bounds),
                    None => bounds,
                });
            }
        }
        union
    }
}

impl FromIterator<NodeRef> for Scene {
    fn from_iter<I: IntoIterator<Item = NodeRef>>(iter: I) -> Self {
        let mut scene = Scene::new();
        for node in iter {
            scene.add(node);
        }
        scene
    }
}

impl From<Vec<NodeRef>> for Scene {
    fn from(nodes: Vec<NodeRef>) -> Self {
        nodes.into_iter().collect()
    }
}
