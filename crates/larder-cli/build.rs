use vergen_git2::{BuildBuilder, CargoBuilder, Emitter, Git2Builder, RustcBuilder};

// Exposes VERGEN_* variables read by `version_info()` in src/config.rs.
// Outside a git checkout the sha falls back to vergen's placeholder.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut emitter = Emitter::default();
    emitter
        .add_instructions(&BuildBuilder::default().build_date(true).build()?)?
        .add_instructions(&CargoBuilder::default().target_triple(true).build()?)?
        .add_instructions(&RustcBuilder::default().semver(true).build()?)?
        .add_instructions(&Git2Builder::default().sha(true).dirty(true).build()?)?;
    emitter.emit()?;
    Ok(())
}
