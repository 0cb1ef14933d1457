pub mod assembly;
pub mod context;
pub mod graph;
pub mod selector;
pub mod timer;

pub use assembly::{assemble, Assembly, Ingress, Services};
pub use context::PipelineContext;
pub use graph::{Graph, GraphError, Node, WorkerId};
pub use selector::{RoutingUnavailable, Selector, SelectorKind};
