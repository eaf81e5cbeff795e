//! Build script for generating the `forester` man pages.
//!
//! One page is rendered for the top-level command and one per subcommand
//! (`forester-create.1`, `forester-grow.1`, ...) into the build output
//! directory.

use std::env;
use std::io::Write;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

use cli::Cli;

fn render(man: &Man) -> Result<Vec<u8>, std::io::Error> {
    let mut buffer = Vec::new();
    man.render(&mut buffer)?;
    Ok(buffer)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "cargo:rerun-if-changed=build.rs")?;
    writeln!(stdout, "cargo:rerun-if-changed=src/cli/mod.rs")?;

    let raw_out_dir = env::var_os("OUT_DIR").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;
    let out_dir = Utf8PathBuf::from_path_buf(raw_out_dir.into())
        .map_err(|path| format!("OUT_DIR is not UTF-8: {}", path.display()))?;
    let dir = Dir::open_ambient_dir(&out_dir, ambient_authority())?;

    let command = Cli::command();
    dir.write("forester.1", render(&Man::new(command.clone()))?)?;
    for sub in command.get_subcommands() {
        let name = format!("forester-{}", sub.get_name());
        let page = render(&Man::new(sub.clone()).title(name.as_str()))?;
        dir.write(format!("{name}.1"), page)?;
    }

    Ok(())
}
