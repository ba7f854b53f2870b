//-
// Copyright (c) 2024, the Arcmail Developers
//
// This file is part of Arcmail.
//
// Arcmail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Arcmail is distributed in the hope that  it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Arcmail. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use structopt::StructOpt;

use crate::support::sysexits::*;

#[derive(StructOpt)]
#[structopt(
    name = "arcmail",
    about = "A long-running mail archive server.",
    author = "The Arcmail Developers"
)]
enum Command {
    /// Run the archive server.
    Serve {
        /// Path to the archive database.
        #[structopt(long, parse(from_os_str))]
        db: PathBuf,
        /// Address to listen on for IMAP connections.
        #[structopt(long, default_value = "127.0.0.1:1143")]
        listen: String,
    },

    /// Recover messages that have been deleted.
    ///
    /// Searches for deleted messages in the given mailbox and recovers
    /// those the selector matches. Messages can be restored after an
    /// EXPUNGE until the vacuum permanently removes them some weeks
    /// later.
    Undelete {
        /// Show what would happen, then roll back.
        #[structopt(short = "n")]
        dry_run: bool,
        /// Also report who deleted each message, when, and why.
        #[structopt(short = "v")]
        verbose: bool,
        /// Path to the archive database.
        #[structopt(parse(from_os_str))]
        db: PathBuf,
        /// Fully-qualified mailbox path.
        mailbox: String,
        /// Search keys, e.g.: uid 1:5,9 / flag \Deleted / header subject x
        selector: Vec<String>,
    },
}

pub fn main() {
    let command = Command::from_args();
    crate::init_simple_log();

    match command {
        Command::Serve { db, listen } => {
            if let Err(e) = super::serve::serve(&db, &listen) {
                eprintln!("arcmail: {}", e);
                EX_UNAVAILABLE.exit();
            }
        },

        Command::Undelete {
            dry_run,
            verbose,
            db,
            mailbox,
            selector,
        } => {
            let request = super::undelete::Request {
                dry_run,
                verbose,
                mailbox,
                selector_args: selector,
            };
            match super::undelete::run_on_db(&db, &request) {
                Ok(report) => {
                    for line in report.lines {
                        println!("arcmail: {}", line);
                    }
                },
                Err(e) => {
                    eprintln!("arcmail: {}", e);
                    EX_UNAVAILABLE.exit();
                },
            }
        },
    }
}
