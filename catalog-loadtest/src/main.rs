//! Runs load tests against an Iceberg REST catalog service.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    catalog_loadtest::cli::execute()
}
