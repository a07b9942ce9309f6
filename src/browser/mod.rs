pub mod headless;
pub mod session_pool;

pub use headless::launch_headless_browser;
pub use session_pool::{PooledSession, SessionPool};
