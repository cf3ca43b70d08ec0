//! `sql-file-output`: write each row as an `INSERT` statement to SQL files,
//! with optional CREATE/TRUNCATE preamble and split rotation.

mod config;
mod sql;
mod writer;

pub use config::{Config, Dialect, FileConfig};
pub use writer::SqlFileOutput;

use rowpipe_engine::registry::parse_config;
use rowpipe_engine::TransformRegistry;

pub const NAME: &str = "sql-file-output";

pub fn register(registry: &mut TransformRegistry) {
    registry.register_transform(
        NAME,
        "Write rows as SQL INSERT statements to (split) files",
        |config| Ok(SqlFileOutput::new(parse_config(config)?)),
    );
}
