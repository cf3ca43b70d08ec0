//! `ldif-input`: read LDIF entries from files as rows.

mod config;
mod parser;
mod source;

pub use config::Config;
pub use parser::{LdifReader, LdifRecord};
pub use source::LdifInput;

use rowpipe_engine::registry::parse_config;
use rowpipe_engine::TransformRegistry;

pub const NAME: &str = "ldif-input";

pub fn register(registry: &mut TransformRegistry) {
    registry.register_source(NAME, "Read entries from LDIF files", |config| {
        Ok(LdifInput::new(parse_config(config)?))
    });
}
