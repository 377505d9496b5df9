//! Model Categories
//!
//! Every category is served by the same coordinator and executor. What
//! differs between them is data: the operation name a category answers to,
//! the payload fields that operation needs, the shape of its result, and
//! whether a completion signal follows the result.
//!
//! The registry here is that data. Nothing else in the crate branches on a
//! category.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

// ============================================================================
// Categories
// ============================================================================

/// Kind of model a coordinator hosts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    /// Conversational text generation
    Chat,
    /// Speech recognition
    AudioTextToText,
    /// Answering questions about an image
    ImageTextToText,
    /// Speech synthesis
    TextToSpeech,
    /// Per-pixel depth maps
    DepthEstimation,
    /// Answering questions about a scanned document
    DocumentQuestionAnswering,
    /// Image labelling
    ImageClassification,
    /// Bounding boxes for objects in an image
    ObjectDetection,
    /// Chat about an attached image
    VisualQuestionAnswering,
}

impl Category {
    /// All categories in registry order
    pub const ALL: [Category; 9] = [
        Category::Chat,
        Category::AudioTextToText,
        Category::ImageTextToText,
        Category::TextToSpeech,
        Category::DepthEstimation,
        Category::DocumentQuestionAnswering,
        Category::ImageClassification,
        Category::ObjectDetection,
        Category::VisualQuestionAnswering,
    ];

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.descriptor().name
    }

    /// Registry entry for this category
    #[must_use]
    pub fn descriptor(&self) -> &'static CategoryDescriptor {
        // REGISTRY is indexed in declaration order
        &REGISTRY[*self as usize]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned for an unrecognized category name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown model category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ============================================================================
// Descriptors
// ============================================================================

/// Shape of the value an operation produces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultKind {
    /// Generated text
    Text,
    /// Transcribed speech
    Transcript,
    /// Free-form answer to a question
    Answer,
    /// Encoded audio samples
    Audio,
    /// Depth map image
    DepthMap,
    /// Ranked labels with scores
    Labels,
    /// Labelled bounding boxes
    Detections,
}

/// Per-category operation contract
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CategoryDescriptor {
    /// Category this entry describes
    pub category: Category,
    /// Wire name of the category
    pub name: &'static str,
    /// Operation name the executor answers to
    pub operation: &'static str,
    /// Payload fields the operation cannot run without
    pub required_fields: &'static [&'static str],
    /// What the result carries
    pub result_kind: ResultKind,
    /// Whether `onDone` follows a successful result
    pub emits_done: bool,
}

impl CategoryDescriptor {
    /// Whether `operation` is the one this category serves
    #[must_use]
    pub fn accepts(&self, operation: &str) -> bool {
        self.operation == operation
    }

    /// First required field absent from `payload`
    ///
    /// A payload that is not a JSON object is missing every field.
    #[must_use]
    pub fn missing_field(&self, payload: &Value) -> Option<&'static str> {
        let object = payload.as_object();
        self.required_fields
            .iter()
            .copied()
            .find(|field| object.map_or(true, |o| o.get(*field).map_or(true, Value::is_null)))
    }
}

static REGISTRY: [CategoryDescriptor; 9] = [
    CategoryDescriptor {
        category: Category::Chat,
        name: "chat",
        operation: "prompt",
        required_fields: &["messages"],
        result_kind: ResultKind::Text,
        emits_done: true,
    },
    CategoryDescriptor {
        category: Category::AudioTextToText,
        name: "audio-text-to-text",
        operation: "transcribe",
        required_fields: &["audio"],
        result_kind: ResultKind::Transcript,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::ImageTextToText,
        name: "image-text-to-text",
        operation: "ask",
        required_fields: &["image", "question"],
        result_kind: ResultKind::Answer,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::TextToSpeech,
        name: "text-to-speech",
        operation: "speak",
        required_fields: &["text"],
        result_kind: ResultKind::Audio,
        emits_done: true,
    },
    CategoryDescriptor {
        category: Category::DepthEstimation,
        name: "depth-estimation",
        operation: "estimate",
        required_fields: &["image"],
        result_kind: ResultKind::DepthMap,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::DocumentQuestionAnswering,
        name: "document-question-answering",
        operation: "ask",
        required_fields: &["question", "image"],
        result_kind: ResultKind::Answer,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::ImageClassification,
        name: "image-classification",
        operation: "classify",
        required_fields: &["image"],
        result_kind: ResultKind::Labels,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::ObjectDetection,
        name: "object-detection",
        operation: "detect",
        required_fields: &["image"],
        result_kind: ResultKind::Detections,
        emits_done: false,
    },
    CategoryDescriptor {
        category: Category::VisualQuestionAnswering,
        name: "visual-question-answering",
        operation: "prompt",
        required_fields: &["messages"],
        result_kind: ResultKind::Text,
        emits_done: true,
    },
];

// ============================================================================
// Typed operations
// ============================================================================

/// A chat message for `prompt`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`
    pub role: String,
    /// Message text
    pub content: String,
    /// Base64 image attached to the message (visual question answering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ChatMessage {
    /// A user turn
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            image: None,
        }
    }

    /// A system turn
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            image: None,
        }
    }

    /// Attach an image to this message
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Typed form of every operation the registry knows
///
/// Converts to the generic `(name, payload)` pair the executor receives.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Chat completion
    Prompt {
        /// Conversation so far
        messages: Vec<ChatMessage>,
        /// Generation settings passed through to the runtime
        settings: Option<Value>,
    },
    /// Speech recognition on base64 audio
    Transcribe {
        /// Encoded audio
        audio: String,
    },
    /// Question about an image or document
    Ask {
        /// Encoded image
        image: String,
        /// The question
        question: String,
    },
    /// Image classification
    Classify {
        /// Encoded image
        image: String,
    },
    /// Object detection
    Detect {
        /// Encoded image
        image: String,
    },
    /// Depth estimation
    Estimate {
        /// Encoded image
        image: String,
    },
    /// Speech synthesis
    Speak {
        /// Text to speak
        text: String,
        /// Voice identifier
        voice: Option<String>,
        /// Playback speed multiplier
        speed: Option<f64>,
    },
}

impl Operation {
    /// Wire name of the operation
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Prompt { .. } => "prompt",
            Operation::Transcribe { .. } => "transcribe",
            Operation::Ask { .. } => "ask",
            Operation::Classify { .. } => "classify",
            Operation::Detect { .. } => "detect",
            Operation::Estimate { .. } => "estimate",
            Operation::Speak { .. } => "speak",
        }
    }

    /// Request payload for this operation
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Operation::Prompt { messages, settings } => {
                let mut payload = Map::new();
                payload.insert("messages".to_string(), json!(messages));
                if let Some(settings) = settings {
                    payload.insert("settings".to_string(), settings.clone());
                }
                Value::Object(payload)
            }
            Operation::Transcribe { audio } => json!({ "audio": audio }),
            Operation::Ask { image, question } => json!({ "image": image, "question": question }),
            Operation::Classify { image }
            | Operation::Detect { image }
            | Operation::Estimate { image } => json!({ "image": image }),
            Operation::Speak { text, voice, speed } => {
                let mut payload = Map::new();
                payload.insert("text".to_string(), json!(text));
                if let Some(voice) = voice {
                    payload.insert("voice".to_string(), json!(voice));
                }
                if let Some(speed) = speed {
                    payload.insert("speed".to_string(), json!(speed));
                }
                Value::Object(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_indexed_by_declaration_order() {
        for category in Category::ALL {
            assert_eq!(category.descriptor().category, category);
        }
    }

    #[test]
    fn test_category_names_match_serde() {
        for category in Category::ALL {
            let wire = serde_json::to_value(category).unwrap();
            assert_eq!(wire, json!(category.as_str()));
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
    }

    #[test]
    fn test_unknown_category() {
        let err = "text-to-video".parse::<Category>().unwrap_err();
        assert_eq!(err.to_string(), "unknown model category: text-to-video");
    }

    #[test]
    fn test_completion_signal_categories() {
        let with_done: Vec<_> = Category::ALL
            .iter()
            .filter(|c| c.descriptor().emits_done)
            .copied()
            .collect();
        assert_eq!(
            with_done,
            vec![
                Category::Chat,
                Category::TextToSpeech,
                Category::VisualQuestionAnswering
            ]
        );
    }

    #[test]
    fn test_missing_field() {
        let descriptor = Category::DocumentQuestionAnswering.descriptor();
        assert_eq!(descriptor.missing_field(&json!({"question": "total?"})), Some("image"));
        assert_eq!(
            descriptor.missing_field(&json!({"question": "total?", "image": null})),
            Some("image")
        );
        assert_eq!(
            descriptor.missing_field(&json!({"question": "total?", "image": "aGk="})),
            None
        );
        assert_eq!(descriptor.missing_field(&json!("raw")), Some("question"));
    }

    #[test]
    fn test_operation_payloads_satisfy_their_category() {
        let cases = [
            (
                Category::Chat,
                Operation::Prompt {
                    messages: vec![ChatMessage::user("hi")],
                    settings: None,
                },
            ),
            (
                Category::AudioTextToText,
                Operation::Transcribe {
                    audio: "UklGRg==".to_string(),
                },
            ),
            (
                Category::ImageTextToText,
                Operation::Ask {
                    image: "aW1n".to_string(),
                    question: "what is this?".to_string(),
                },
            ),
            (
                Category::TextToSpeech,
                Operation::Speak {
                    text: "hello".to_string(),
                    voice: None,
                    speed: Some(1.5),
                },
            ),
            (
                Category::ObjectDetection,
                Operation::Detect {
                    image: "aW1n".to_string(),
                },
            ),
        ];

        for (category, operation) in cases {
            let descriptor = category.descriptor();
            assert!(descriptor.accepts(operation.name()), "{category} rejects {}", operation.name());
            assert_eq!(descriptor.missing_field(&operation.payload()), None);
        }
    }

    #[test]
    fn test_speak_payload_omits_unset_options() {
        let payload = Operation::Speak {
            text: "hey".to_string(),
            voice: Some("af_bella".to_string()),
            speed: None,
        }
        .payload();
        assert_eq!(payload, json!({"text": "hey", "voice": "af_bella"}));
    }
}
