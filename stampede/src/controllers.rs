mod adaptive;
mod window;

pub(crate) use adaptive::run_adaptive;
pub(crate) use window::{AdaptiveWindow, WindowStats};
