//! `regex-eval`: match a field against a regular expression, write the
//! outcome to a boolean field and optionally split capture groups into
//! typed fields.

mod config;
mod transform;

pub use config::Config;
pub use transform::RegexEval;

use rowpipe_engine::registry::parse_config;
use rowpipe_engine::TransformRegistry;

pub const NAME: &str = "regex-eval";

pub fn register(registry: &mut TransformRegistry) {
    registry.register_transform(
        NAME,
        "Evaluate a regular expression against a field, with optional capture groups",
        |config| Ok(RegexEval::new(parse_config(config)?)),
    );
}
