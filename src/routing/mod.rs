// Routing Module
//
// Naming for everything addressable in the graph: nodes, topics and services.

pub mod graph_name;

pub use graph_name::GraphName;
