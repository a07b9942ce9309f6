pub mod checkpoint;
pub mod color;
pub mod loaders;

pub use checkpoint::{dedup_colors, BackupInfo, Checkpoint};
pub use color::{is_valid_hex, normalize_color_value, ColorEntry, RunStats, DEFAULT_BRAND};
pub use loaders::load_color_backlog;
