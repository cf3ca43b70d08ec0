use rowpipe_engine::TransformRegistry;

/// Registry with every bundled transform.
pub fn bundled() -> TransformRegistry {
    let mut registry = TransformRegistry::new();
    source_ldif::register(&mut registry);
    transform_regex_eval::register(&mut registry);
    dest_sql_file::register(&mut registry);
    registry
}
