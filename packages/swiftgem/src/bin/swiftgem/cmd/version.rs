use clap::crate_version;
use color_eyre::Result;

pub async fn exec() -> Result<()> {
    println!("swiftgem {}", crate_version!());
    Ok(())
}
