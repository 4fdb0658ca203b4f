//! `sstun` runs the local peer, the remote peer, or both, depending on the
//! command-line flags. All configuration comes from the command line; there
//! is no configuration file and no persistent state.

use std::process::ExitCode;

use clap::Command;

mod service;

fn main() -> ExitCode {
    let mut app = Command::new("sstun")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A pair of proxy peers tunnelling TCP and UDP through AEAD-encrypted sessions");
    app = service::define_command_line_options(app);

    let matches = app.get_matches();
    service::main(&matches)
}
