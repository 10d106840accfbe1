use anyhow::Result;

fn main() -> Result<()> {
    labbox::cli::run()
}
