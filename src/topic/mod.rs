// Topic Module
//
// Many-to-many typed message channels. Membership is never stored: publishers
// and subscribers find each other through the registry and talk directly.

pub mod publisher;
pub mod subscriber;

pub use publisher::Publisher;
pub use subscriber::Subscriber;
