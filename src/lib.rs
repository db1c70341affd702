//! Shopgraph: a conversational workflow engine for shop-assistant traffic.
//!
//! One inbound message flows through routing analysis, entity extraction,
//! tool decision, tool execution, and response generation. Routing picks
//! between a cheap simple path and a concurrent parallel path per message.
//! Around the pipeline sit two two-tier stores (checkpoint persistence and a
//! response cache) and a performance monitor.
//!
//! The [`orchestrator::ShopAssistant`] is the main entry point:
//!
//! ```no_run
//! use std::sync::Arc;
//! use shopgraph::orchestrator::ShopAssistant;
//! # async fn demo(model: Arc<dyn shopgraph::capabilities::ChatModel>,
//! #               backend: Arc<dyn shopgraph::tools::ToolBackend>) {
//! let assistant = ShopAssistant::builder(model, backend)
//!     .build()
//!     .unwrap();
//! let outcome = assistant
//!     .process_message("do you have sony headphones under $100?", None, None)
//!     .await;
//! println!("{}", outcome.response);
//! # }
//! ```

pub mod cache;
pub mod capabilities;
pub mod checkpoint;
pub mod config;
pub mod entities;
pub mod faults;
pub mod graph;
pub mod message;
pub mod monitor;
pub mod orchestrator;
pub mod stage;
pub mod stages;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod types;
pub mod utils;

pub use config::{EntryMode, WorkflowConfig};
pub use message::Message;
pub use orchestrator::{ProcessOutcome, ShopAssistant, ShopAssistantBuilder};
pub use state::ConversationState;
pub use types::{RoutePath, StageKind};
