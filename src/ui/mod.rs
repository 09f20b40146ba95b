pub mod icons;
pub mod live;

pub use live::{LiveDisplay, color_for, format_message};
