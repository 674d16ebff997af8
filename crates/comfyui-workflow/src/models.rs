use std::{any::Any, collections::HashMap};

use serde::{Deserialize, Serialize};

/// Struct representing an API-format ComfyUI workflow.
#[derive(Default, Serialize, Deserialize, Debug)]
pub struct Workflow {
    /// The workflow graph, indexed by node id.
    #[serde(flatten)]
    pub nodes: HashMap<String, NodeOrUnknown>,
}

impl Workflow {
    /// Parses a workflow from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid API-format workflow.
    pub fn from_json(json: &str) -> Result<Self, crate::WorkflowError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Gets a reference to the node with the given id.
    pub fn get_node_by_id(&self, id: &str) -> Option<&dyn Node> {
        match self.nodes.get(id) {
            Some(NodeOrUnknown::Node(node)) => Some(node.as_ref()),
            Some(NodeOrUnknown::GenericNode(node)) => Some(node),
            None => None,
        }
    }

    /// Gets a typed reference to the node with the given id.
    ///
    /// Returns `None` if the node does not exist or is of a different type.
    pub fn get_typed_node<T: Node + 'static>(&self, id: &str) -> Option<&T> {
        self.get_node_by_id(id).and_then(as_node::<T>)
    }

    /// Node ids in a stable order: numeric ids first, in numeric order, then the rest.
    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            (Ok(_), Err(_)) => std::cmp::Ordering::Less,
            (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        });
        ids
    }

    /// Iterates over all nodes of type `T`, in `node_ids` order.
    pub fn nodes_of_type<T: Node + 'static>(&self) -> impl Iterator<Item = (&str, &T)> + '_ {
        self.node_ids()
            .into_iter()
            .filter_map(move |id| self.get_typed_node::<T>(id).map(|node| (id, node)))
    }
}

/// Enum capturing all possible node types.
#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
pub enum NodeOrUnknown {
    /// Enum variant representing a known node.
    Node(Box<dyn Node>),
    /// Variant capturing unknown nodes.
    GenericNode(GenericNode),
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Trait to allow downcasting to `dyn Any`.
pub trait AsAny {
    /// Get a reference to `dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

/// Get a reference to a node of a specific type.
///
/// Returns `None` if the node is of another type.
pub fn as_node<T: Node + 'static>(node: &dyn Node) -> Option<&T> {
    node.as_any().downcast_ref::<T>()
}

/// A node of the workflow graph, tagged by its ComfyUI `class_type`.
#[typetag::serde(tag = "class_type", content = "inputs")]
pub trait Node: std::fmt::Debug + AsAny {
    /// Ids of the nodes this node takes inputs from.
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_>;
}

/// Struct representing a node of a class this crate does not model.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenericNode {
    /// The node class type.
    pub class_type: String,
    /// The node inputs.
    pub inputs: HashMap<String, GenericValue>,
}

#[typetag::serde]
impl Node for GenericNode {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.inputs.values().filter_map(|input| input.node_id()))
    }
}

/// Enum of possible generic node input types.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum GenericValue {
    /// Bool input variant.
    Bool(bool),
    /// Integer input variant.
    Int(i64),
    /// Float input variant.
    Float(f64),
    /// String input variant.
    String(String),
    /// Node connection input variant.
    NodeConnection(NodeConnection),
    /// Anything else (lists, objects).
    Other(serde_json::Value),
}

impl GenericValue {
    /// Get the node id of the input.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            GenericValue::NodeConnection(node_connection) => Some(&node_connection.node_id),
            _ => None,
        }
    }
}

/// Struct representing a node input connection, `[node_id, output_index]` on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "(String, u32)")]
#[serde(into = "(String, u32)")]
pub struct NodeConnection {
    /// The node id of the node providing the input.
    pub node_id: String,
    /// The index of the output from the node providing the input.
    pub output_index: u32,
}

impl From<(String, u32)> for NodeConnection {
    fn from((node_id, output_index): (String, u32)) -> Self {
        Self {
            node_id,
            output_index,
        }
    }
}

impl From<NodeConnection> for (String, u32) {
    fn from(
        NodeConnection {
            node_id,
            output_index,
        }: NodeConnection,
    ) -> Self {
        (node_id, output_index)
    }
}

/// Enum of inputs to a node: either a widget value or a link to another node.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum Input<T> {
    /// Node connection input variant.
    NodeConnection(NodeConnection),
    /// Widget input variant.
    Value(T),
}

impl<T> Input<T> {
    /// Get the value of the input.
    pub fn value(&self) -> Option<&T> {
        match self {
            Input::NodeConnection(_) => None,
            Input::Value(value) => Some(value),
        }
    }

    /// Get the node id of the input.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Input::NodeConnection(node_connection) => Some(node_connection.node_id.as_str()),
            Input::Value(_) => None,
        }
    }
}

/// Struct representing a KSampler node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KSampler {
    /// The cfg scale parameter.
    pub cfg: Input<f32>,
    /// The denoise parameter.
    pub denoise: Input<f32>,
    /// The sampler name.
    pub sampler_name: Input<String>,
    /// The scheduler used.
    pub scheduler: Input<String>,
    /// The seed.
    pub seed: Input<u64>,
    /// The number of steps.
    pub steps: Input<u32>,
    /// The positive conditioning input connection.
    pub positive: NodeConnection,
    /// The negative conditioning input connection.
    pub negative: NodeConnection,
    /// The model input connection.
    pub model: NodeConnection,
    /// The latent image input connection.
    pub latent_image: NodeConnection,
}

#[typetag::serde]
impl Node for KSampler {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        let inputs = [
            self.cfg.node_id(),
            self.denoise.node_id(),
            self.sampler_name.node_id(),
            self.scheduler.node_id(),
            self.seed.node_id(),
            self.steps.node_id(),
        ]
        .into_iter()
        .flatten();
        Box::new(inputs.chain([
            self.positive.node_id.as_str(),
            self.negative.node_id.as_str(),
            self.model.node_id.as_str(),
            self.latent_image.node_id.as_str(),
        ]))
    }
}

/// Struct representing a CLIPTextEncode node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CLIPTextEncode {
    /// The text to encode.
    pub text: Input<String>,
    /// The CLIP model input connection.
    pub clip: NodeConnection,
}

#[typetag::serde]
impl Node for CLIPTextEncode {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(
            [self.text.node_id(), Some(self.clip.node_id.as_str())]
                .into_iter()
                .flatten(),
        )
    }
}

/// Struct representing a CheckpointLoaderSimple node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckpointLoaderSimple {
    /// The checkpoint name.
    pub ckpt_name: Input<String>,
}

#[typetag::serde]
impl Node for CheckpointLoaderSimple {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new([self.ckpt_name.node_id()].into_iter().flatten())
    }
}

/// Struct representing a LoraLoader node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoraLoader {
    /// The name of the LoRA file.
    pub lora_name: Input<String>,
    /// The model (UNet) strength.
    pub strength_model: Input<f32>,
    /// The CLIP (text encoder) strength.
    pub strength_clip: Input<f32>,
    /// The model input connection.
    pub model: NodeConnection,
    /// The CLIP input connection.
    pub clip: NodeConnection,
}

#[typetag::serde]
impl Node for LoraLoader {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        let inputs = [
            self.lora_name.node_id(),
            self.strength_model.node_id(),
            self.strength_clip.node_id(),
        ]
        .into_iter()
        .flatten();
        Box::new(inputs.chain([self.model.node_id.as_str(), self.clip.node_id.as_str()]))
    }
}

/// Struct representing a LoraLoaderModelOnly node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoraLoaderModelOnly {
    /// The name of the LoRA file.
    pub lora_name: Input<String>,
    /// The model (UNet) strength.
    pub strength_model: Input<f32>,
    /// The model input connection.
    pub model: NodeConnection,
}

#[typetag::serde]
impl Node for LoraLoaderModelOnly {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        let inputs = [self.lora_name.node_id(), self.strength_model.node_id()]
            .into_iter()
            .flatten();
        Box::new(inputs.chain([self.model.node_id.as_str()]))
    }
}

/// Struct representing a LoadImage node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoadImage {
    /// The name of the image to load.
    pub image: Input<String>,
}

#[typetag::serde]
impl Node for LoadImage {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new([self.image.node_id()].into_iter().flatten())
    }
}

/// Struct representing a VAEEncode node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VAEEncode {
    /// Pixel input connection.
    pub pixels: NodeConnection,
    /// VAE model input connection.
    pub vae: NodeConnection,
}

#[typetag::serde]
impl Node for VAEEncode {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new([self.pixels.node_id.as_str(), self.vae.node_id.as_str()].into_iter())
    }
}

/// Struct representing a VAEDecode node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VAEDecode {
    /// Latent output samples to decode.
    pub samples: NodeConnection,
    /// VAE model input connection.
    pub vae: NodeConnection,
}

#[typetag::serde]
impl Node for VAEDecode {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new([self.samples.node_id.as_str(), self.vae.node_id.as_str()].into_iter())
    }
}

/// Struct representing an EmptyLatentImage node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmptyLatentImage {
    /// The batch size.
    pub batch_size: Input<u32>,
    /// The image width.
    pub width: Input<u32>,
    /// The image height.
    pub height: Input<u32>,
}

#[typetag::serde]
impl Node for EmptyLatentImage {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(
            [
                self.batch_size.node_id(),
                self.width.node_id(),
                self.height.node_id(),
            ]
            .into_iter()
            .flatten(),
        )
    }
}

/// Struct representing a SaveImage node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SaveImage {
    /// The filename prefix.
    pub filename_prefix: Input<String>,
    /// The image input connection.
    pub images: NodeConnection,
}

#[typetag::serde]
impl Node for SaveImage {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(
            [
                self.filename_prefix.node_id(),
                Some(self.images.node_id.as_str()),
            ]
            .into_iter()
            .flatten(),
        )
    }
}

/// Struct representing a PreviewImage node.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PreviewImage {
    /// The images to preview.
    pub images: NodeConnection,
}

#[typetag::serde]
impl Node for PreviewImage {
    fn connections(&'_ self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new([self.images.node_id.as_str()].into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_and_unknown_nodes() {
        let workflow = Workflow::from_json(
            r#"{
                "4": {
                    "class_type": "CheckpointLoaderSimple",
                    "inputs": { "ckpt_name": "realisticVisionV60B1_v51HyperVAE.safetensors" },
                    "_meta": { "title": "Load Checkpoint" }
                },
                "12": {
                    "class_type": "ImageScale",
                    "inputs": { "upscale_method": "nearest-exact", "width": 512, "image": ["10", 0] }
                }
            }"#,
        )
        .unwrap();

        let ckpt = workflow.get_typed_node::<CheckpointLoaderSimple>("4").unwrap();
        assert_eq!(
            ckpt.ckpt_name.value().map(String::as_str),
            Some("realisticVisionV60B1_v51HyperVAE.safetensors")
        );

        match &workflow.nodes["12"] {
            NodeOrUnknown::GenericNode(node) => {
                assert_eq!(node.class_type, "ImageScale");
                assert_eq!(node.connections().collect::<Vec<_>>(), vec!["10"]);
            }
            other => panic!("expected a generic node, got {:?}", other),
        }
    }

    #[test]
    fn test_input_link_and_value() {
        let linked: Input<f32> = serde_json::from_str(r#"["7", 1]"#).unwrap();
        assert_eq!(linked.node_id(), Some("7"));
        assert!(linked.value().is_none());

        let value: Input<f32> = serde_json::from_str("2").unwrap();
        assert_eq!(value.value(), Some(&2.0));
        assert!(value.node_id().is_none());
    }

    #[test]
    fn test_node_ids_are_ordered_numerically() {
        let workflow = Workflow::from_json(
            r#"{
                "10": { "class_type": "LoadImage", "inputs": { "image": "b.png" } },
                "9": { "class_type": "LoadImage", "inputs": { "image": "a.png" } },
                "x": { "class_type": "LoadImage", "inputs": { "image": "c.png" } }
            }"#,
        )
        .unwrap();

        assert_eq!(workflow.node_ids(), vec!["9", "10", "x"]);
        let images: Vec<_> = workflow
            .nodes_of_type::<LoadImage>()
            .filter_map(|(_, node)| node.image.value().cloned())
            .collect();
        assert_eq!(images, vec!["a.png", "b.png", "c.png"]);
    }
}
