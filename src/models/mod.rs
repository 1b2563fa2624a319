pub mod events;
pub mod playlist;
pub mod setting;
pub mod song;

pub use events::*;
pub use playlist::*;
pub use setting::*;
pub use song::*;
