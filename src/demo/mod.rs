// Demo Nodes
//
// Small nodes exercising every channel kind; the binary runs them.

pub mod service_nodes;
pub mod topic_nodes;

pub use service_nodes::{add_two_ints, AddTwoIntsClientNode, AddTwoIntsServerNode};
pub use topic_nodes::{ListenerNode, TalkerNode};

/// Names used by the binary
pub mod names {
    pub const TALKER: &str = "/runar/demo/talker";
    pub const LISTENER: &str = "/runar/demo/listener";
    pub const TOPIC: &str = "/runar/demo/chatter";
    pub const SERVER: &str = "/runar/demo/add_two_ints_server";
    pub const CLIENT: &str = "/runar/demo/add_two_ints_client";
    pub const SERVICE: &str = "/runar/demo/add_two_ints";
}
