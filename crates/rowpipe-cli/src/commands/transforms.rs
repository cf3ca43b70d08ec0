use anyhow::Result;

use crate::registry;

/// Execute the `transforms` command: list bundled transforms by name.
pub fn execute() -> Result<()> {
    let registry = registry::bundled();
    for info in registry.entries() {
        println!("  {:18} [{}]", info.name, info.role);
        if !info.description.is_empty() {
            println!("    {}", info.description);
        }
    }
    Ok(())
}
