//! Build script rendering `hangar.1` plus one `hangar-<subcommand>.1` page
//! per subcommand into the build output directory.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(command: clap::Command, out_dir: &Path, title: &str) -> io::Result<()> {
    let mut buffer = Vec::new();
    Man::new(command).title(title).render(&mut buffer)?;
    fs::write(out_dir.join(format!("{title}.1")), buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let out_dir = env::var_os("OUT_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR was not set"))?;

    let root = Cli::command();
    for sub in root.get_subcommands() {
        let title = format!("hangar-{}", sub.get_name());
        render(sub.clone(), &out_dir, &title)?;
    }
    render(root, &out_dir, "hangar")?;

    Ok(())
}
