use anyhow::Result;

fn main() -> Result<()> {
    xproc::cli::run()
}
