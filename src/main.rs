fn main() -> anyhow::Result<()> {
    pms::run()?;
    Ok(())
}
