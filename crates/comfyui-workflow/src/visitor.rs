use std::collections::HashSet;

use crate::models::*;

/// Trait for visiting nodes in a ComfyUI graph, walking from a node towards its inputs.
pub trait Visitor {
    /// Visits a node in a ComfyUI graph.
    ///
    /// # Arguments
    ///
    /// * `workflow` - The workflow that contains the graph.
    /// * `id` - The id of the node to visit.
    /// * `node` - The node to visit.
    fn visit(&mut self, workflow: &Workflow, _id: &str, node: &dyn Node) {
        walk(self, workflow, node)
    }
}

/// Visits every node feeding into `node`.
pub fn walk<V: Visitor + ?Sized>(visitor: &mut V, workflow: &Workflow, node: &dyn Node) {
    for c in node.connections() {
        if let Some(input) = workflow.get_node_by_id(c) {
            visitor.visit(workflow, c, input);
        }
    }
}

/// Finds the nearest node of type `T` upstream of (and including) the starting node.
pub(crate) struct FindNode<T: Node + 'static> {
    pub(crate) found: Option<String>,
    seen: HashSet<String>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: Node + 'static> FindNode<T> {
    pub(crate) fn new() -> Self {
        Self {
            found: None,
            seen: HashSet::new(),
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T: Node + 'static> Visitor for FindNode<T> {
    fn visit(&mut self, workflow: &Workflow, id: &str, node: &dyn Node) {
        if self.found.is_some() || !self.seen.insert(id.to_string()) {
            return;
        }
        if as_node::<T>(node).is_some() {
            self.found = Some(id.to_string());
            return;
        }
        walk(self, workflow, node)
    }
}

/// Finds the id of the nearest node of type `T` upstream of `start`, including `start` itself.
pub fn find_upstream<T: Node + 'static>(workflow: &Workflow, start: &str) -> Option<String> {
    let node = workflow.get_node_by_id(start)?;
    let mut finder = FindNode::<T>::new();
    finder.visit(workflow, start, node);
    finder.found
}

/// Finds the output node of the workflow: a node with inputs that no other node consumes.
///
/// Returns `None` if the graph has no such node or has more than one.
pub fn find_output_node(workflow: &Workflow) -> Option<String> {
    let consumed: HashSet<&str> = workflow
        .nodes
        .values()
        .flat_map(|value| match value {
            NodeOrUnknown::Node(node) => node.connections(),
            NodeOrUnknown::GenericNode(node) => node.connections(),
        })
        .collect();
    let mut outputs = workflow.node_ids().into_iter().filter(|id| {
        !consumed.contains(id)
            && workflow
                .get_node_by_id(id)
                .map(|node| node.connections().next().is_some())
                .unwrap_or_default()
    });
    match (outputs.next(), outputs.next()) {
        (Some(output), None) => Some(output.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"{
        "1": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "a.safetensors" } },
        "2": { "class_type": "LoraLoaderModelOnly",
               "inputs": { "lora_name": "x.safetensors", "strength_model": 1.0, "model": ["1", 0] } },
        "3": { "class_type": "LoraLoaderModelOnly",
               "inputs": { "lora_name": "y.safetensors", "strength_model": 0.5, "model": ["2", 0] } },
        "4": { "class_type": "PreviewImage", "inputs": { "images": ["3", 0] } }
    }"#;

    #[test]
    fn test_find_output_node() {
        let workflow = Workflow::from_json(CHAIN).unwrap();
        assert_eq!(find_output_node(&workflow), Some("4".to_string()));
    }

    #[test]
    fn test_find_output_node_ambiguous() {
        let workflow = Workflow::from_json(
            r#"{
                "1": { "class_type": "LoadImage", "inputs": { "image": "a.png" } },
                "2": { "class_type": "PreviewImage", "inputs": { "images": ["1", 0] } },
                "3": { "class_type": "PreviewImage", "inputs": { "images": ["1", 0] } }
            }"#,
        )
        .unwrap();
        assert_eq!(find_output_node(&workflow), None);
    }

    #[test]
    fn test_find_upstream_returns_nearest() {
        let workflow = Workflow::from_json(CHAIN).unwrap();
        assert_eq!(
            find_upstream::<LoraLoaderModelOnly>(&workflow, "4"),
            Some("3".to_string())
        );
        assert_eq!(
            find_upstream::<CheckpointLoaderSimple>(&workflow, "4"),
            Some("1".to_string())
        );
        assert_eq!(find_upstream::<KSampler>(&workflow, "4"), None);
        assert_eq!(find_upstream::<KSampler>(&workflow, "missing"), None);
    }

    #[test]
    fn test_find_upstream_survives_cycles() {
        let workflow = Workflow::from_json(
            r#"{
                "1": { "class_type": "Loop", "inputs": { "next": ["2", 0] } },
                "2": { "class_type": "Loop", "inputs": { "next": ["1", 0] } }
            }"#,
        )
        .unwrap();
        assert_eq!(find_upstream::<KSampler>(&workflow, "1"), None);
    }
}
