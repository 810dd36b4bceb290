pub mod collaborators;
pub mod events;
pub mod manager;
pub mod memory;
pub mod protocol;
pub mod recovery;


pub use collaborators::*;
pub use events::*;
pub use manager::*;
pub use memory::*;
pub use protocol::*;
pub use recovery::*;
