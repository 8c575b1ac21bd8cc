pub mod body;
pub mod command;
pub mod config;
pub mod directories;
pub mod directory;
pub mod dispatch;
pub mod identity;
pub mod message;
pub mod mime;
pub mod notifier;
pub mod pipeline;
pub mod verify;

pub use body::*;
pub use command::*;
pub use config::*;
pub use directories::*;
pub use directory::*;
pub use dispatch::*;
pub use identity::*;
pub use message::*;
pub use mime::*;
pub use notifier::*;
pub use pipeline::*;
pub use verify::*;
