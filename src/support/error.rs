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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox is synthetic")]
    SyntheticMailbox,
    #[error("Mailbox is deleted")]
    DeletedMailbox,
    #[error("UID series exhausted")]
    UidOverflow,
    #[error("Transaction is in failed state: {0}")]
    TransactionFailed(String),
    #[error("Transaction already completed")]
    TransactionCompleted,
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Unparsable selector: {0}")]
    BadSelector(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}
