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

//! Message ingest and expunge.
//!
//! Ingest persists a parsed message into one transaction: dictionary
//! names are interned through helper-row creators, the part tree lands in
//! `bodyparts`/`part_numbers`, header fields and addresses in their
//! normalised tables, and the UID is allocated from the mailbox row under
//! the write transaction's lock. Expunge moves rows to
//! `deleted_messages`, where `undelete` can find them until the vacuum
//! obliterates them for good.

use chrono::prelude::*;
use log::info;

use crate::db::query::Query;
use crate::db::transaction::Transaction;
use crate::db::Connection;
use crate::mime::bodypart::Bodypart;
use crate::mime::field::{FieldData, FieldType};
use crate::mime::header::Header;
use crate::support::error::Error;

use super::intern::{field_name_creator, flag_creator, InternKind};
use super::mailbox::{Mbx, Registry};
use super::message::Message;
use super::model::{MailboxId, MessageId, Uid, UidSet, UserId};

/// Persists `message` into `mailbox`, returning the allocated UID and the
/// new `messages` row id.
pub fn inject(
    cxn: &mut Connection,
    registry: &mut Registry,
    mailbox: Mbx,
    message: &Message,
    flags: &[String],
) -> Result<(Uid, MessageId), Error> {
    let mailbox_id = registry.id(mailbox).ok_or(Error::SyntheticMailbox)?;
    if registry.deleted(mailbox) {
        return Err(Error::DeletedMailbox);
    }

    let field_names = collect_field_names(message);

    let mut t = cxn.transaction()?;

    let mut fields = field_name_creator(field_names);
    fields.execute(&mut t);
    let mut flag_rows = flag_creator(flags.to_vec());
    flag_rows.execute(&mut t);
    if t.failed() {
        let cause = t.error().unwrap_or("").to_owned();
        let _ = t.rollback();
        return Err(Error::TransactionFailed(cause));
    }

    // The write transaction holds the store's write lock, which is what
    // keeps this read-modify-write of uidnext safe.
    let (uidnext, nextmodseq) = read_counters(&mut t, mailbox_id)?;
    let uid = Uid::of(uidnext).ok_or(Error::UidOverflow)?;

    let q = Query::new(
        "insert into messages (rfc822size, idate, modseq) \
         values ($1, $2, $3)",
    );
    q.borrow_mut()
        .bind(message.rfc822_size())
        .bind(Utc::now().timestamp())
        .bind(nextmodseq);
    t.enqueue(&q);

    let message_id = last_insert_rowid(&mut t)?;

    if let Some(date) = message.header().date() {
        let q = Query::new(
            "insert into date_fields (message, value) values ($1, $2)",
        );
        q.borrow_mut().bind(message_id).bind(date.timestamp());
        t.enqueue(&q);
    }

    insert_header(&mut t, message_id, "", message.header())?;
    insert_parts(&mut t, message_id, "", message.parts())?;

    let q = Query::new(
        "insert into mailbox_messages (mailbox, uid, message, modseq) \
         values ($1, $2, $3, $4)",
    );
    q.borrow_mut()
        .bind(mailbox_id)
        .bind(uid)
        .bind(message_id)
        .bind(nextmodseq);
    t.enqueue(&q);

    for flag in flags {
        let id = match InternKind::Flags.id(flag) {
            Some(id) => id,
            None => continue,
        };
        let q = Query::new(
            "insert or ignore into flags (mailbox, uid, flag) \
             values ($1, $2, $3)",
        );
        q.borrow_mut().bind(mailbox_id).bind(uid).bind(id);
        t.enqueue(&q);
    }

    let q = Query::new(
        "update mailboxes set uidnext = $2, nextmodseq = $3 \
         where id = $1",
    );
    q.borrow_mut()
        .bind(mailbox_id)
        .bind(uidnext + 1)
        .bind(nextmodseq + 1);
    t.enqueue(&q);

    t.commit()?;

    // The committed advance is what watchers hear about.
    registry.set_uidnext(mailbox, uidnext + 1);

    Ok((uid, MessageId(message_id)))
}

/// Moves the selected messages to `deleted_messages`.
pub fn expunge(
    cxn: &mut Connection,
    registry: &mut Registry,
    mailbox: Mbx,
    uids: &UidSet,
    deleted_by: Option<UserId>,
    reason: &str,
) -> Result<usize, Error> {
    let mailbox_id = registry.id(mailbox).ok_or(Error::SyntheticMailbox)?;

    let mut t = cxn.transaction()?;

    let q = Query::new(format!(
        "insert into deleted_messages \
         (mailbox, uid, message, deleted_by, deleted_at, reason) \
         select mailbox, uid, message, $2, $3, $4 \
         from mailbox_messages where mailbox = $1 and {}",
        uids.where_clause("uid")
    ));
    q.borrow_mut()
        .bind(mailbox_id)
        .bind(deleted_by.map(|u| u.0))
        .bind(Utc::now().timestamp())
        .bind(reason);
    t.enqueue(&q);

    let q = Query::new(format!(
        "delete from mailbox_messages where mailbox = $1 and {}",
        uids.where_clause("uid")
    ));
    q.borrow_mut().bind(mailbox_id);
    t.enqueue(&q);
    t.execute();

    let counted = Query::new(
        "select count(*) as n from deleted_messages where mailbox = $1",
    );
    counted.borrow_mut().bind(mailbox_id);
    t.enqueue(&counted);

    t.commit()?;

    let n = counted
        .borrow_mut()
        .next_row()
        .map(|r| r.get_i64("n") as usize)
        .unwrap_or(0);
    info!(
        "expunged into deleted_messages of mailbox {} ({} now deleted)",
        mailbox_id.0, n
    );
    Ok(n)
}

fn read_counters(
    t: &mut Transaction,
    mailbox: MailboxId,
) -> Result<(u32, i64), Error> {
    let q = Query::new(
        "select uidnext, nextmodseq from mailboxes where id = $1",
    );
    q.borrow_mut().bind(mailbox);
    t.enqueue(&q);
    t.execute();

    let mut q = q.borrow_mut();
    if let Some(e) = q.error() {
        return Err(Error::QueryFailed(e.to_owned()));
    }
    let row = q.next_row().ok_or(Error::NxMailbox)?;
    Ok((row.get_u32("uidnext"), row.get_i64("nextmodseq")))
}

fn last_insert_rowid(t: &mut Transaction) -> Result<i64, Error> {
    let q = Query::new("select last_insert_rowid() as id");
    t.enqueue(&q);
    t.execute();
    let mut q = q.borrow_mut();
    if let Some(e) = q.error() {
        return Err(Error::QueryFailed(e.to_owned()));
    }
    Ok(q.next_row().map(|r| r.get_i64("id")).unwrap_or(0))
}

fn collect_field_names(message: &Message) -> Vec<String> {
    fn collect_header(out: &mut Vec<String>, h: &Header) {
        for f in h.fields() {
            if !f.ftype().is_address_field() {
                out.push(f.name().to_owned());
            }
        }
    }
    fn collect_parts(out: &mut Vec<String>, parts: &[Bodypart]) {
        for bp in parts {
            collect_header(out, bp.header());
            if let Some(sub) = bp.message() {
                collect_header(out, sub.header());
            }
            collect_parts(out, bp.children());
        }
    }

    let mut out = Vec::new();
    collect_header(&mut out, message.header());
    collect_parts(&mut out, message.parts());
    out.sort();
    out.dedup();
    out
}

/// Writes one header's rows: non-address fields into `header_fields`,
/// address fields into `address_fields`, positions preserving the field
/// order.
fn insert_header(
    t: &mut Transaction,
    message: i64,
    part: &str,
    header: &Header,
) -> Result<(), Error> {
    for (ix, f) in header.fields().iter().enumerate() {
        let position = ix as u32 + 1;

        if let FieldData::Addresses(addrs) = f.field_data() {
            for (number, addr) in addrs.iter().enumerate() {
                let q = Query::new(
                    "insert or ignore into addresses \
                     (name, localpart, domain) values ($1, $2, $3)",
                );
                q.borrow_mut()
                    .bind(addr.name.as_str())
                    .bind(addr.localpart.as_str())
                    .bind(addr.domain.as_str());
                t.enqueue(&q);

                let q = Query::new(
                    "insert into address_fields \
                     (message, part, position, field, number, address) \
                     select $1, $2, $3, $4, $5, id from addresses \
                     where name = $6 and localpart = $7 and domain = $8",
                );
                q.borrow_mut()
                    .bind(message)
                    .bind(part)
                    .bind(position)
                    .bind(f.ftype() as u32)
                    .bind(number as u32)
                    .bind(addr.name.as_str())
                    .bind(addr.localpart.as_str())
                    .bind(addr.domain.as_str());
                t.enqueue(&q);
            }
        } else {
            let q = Query::new(
                "insert into header_fields \
                 (message, part, position, field, value) \
                 select $1, $2, $3, id, $5 from field_names \
                 where name = $4",
            );
            q.borrow_mut()
                .bind(message)
                .bind(part)
                .bind(position)
                .bind(f.name())
                .bind(f.data());
            t.enqueue(&q);
        }
    }

    t.execute();
    if t.failed() {
        return Err(Error::TransactionFailed(
            t.error().unwrap_or("").to_owned(),
        ));
    }
    Ok(())
}

fn insert_parts(
    t: &mut Transaction,
    message: i64,
    prefix: &str,
    parts: &[Bodypart],
) -> Result<(), Error> {
    for bp in parts {
        let part = if prefix.is_empty() {
            bp.number().to_string()
        } else {
            format!("{}.{}", prefix, bp.number())
        };

        let is_container =
            !bp.children().is_empty() || bp.message().is_some();

        if is_container {
            let q = Query::new(
                "insert into part_numbers \
                 (message, part, bodypart, bytes, lines) \
                 values ($1, $2, null, $3, $4)",
            );
            q.borrow_mut()
                .bind(message)
                .bind(part.as_str())
                .bind(bp.num_encoded_bytes())
                .bind(bp.num_encoded_lines());
            t.enqueue(&q);
        } else {
            let q = if bp.has_text() {
                let q = Query::new(
                    "insert into bodyparts (bytes, text, data) \
                     values ($1, $2, null)",
                );
                q.borrow_mut().bind(bp.num_bytes()).bind(bp.text());
                q
            } else {
                let q = Query::new(
                    "insert into bodyparts (bytes, text, data) \
                     values ($1, null, $2)",
                );
                q.borrow_mut()
                    .bind(bp.num_bytes())
                    .bind(bp.data().to_vec());
                q
            };
            t.enqueue(&q);

            let bodypart_id = last_insert_rowid(t)?;
            let q = Query::new(
                "insert into part_numbers \
                 (message, part, bodypart, bytes, lines) \
                 values ($1, $2, $3, $4, $5)",
            );
            q.borrow_mut()
                .bind(message)
                .bind(part.as_str())
                .bind(bodypart_id)
                .bind(bp.num_encoded_bytes())
                .bind(bp.num_encoded_lines());
            t.enqueue(&q);
        }

        insert_header(t, message, &part, bp.header())?;

        if let Some(sub) = bp.message() {
            insert_header(
                t,
                message,
                &format!("{}.rfc822", part),
                sub.header(),
            )?;
        }

        insert_parts(t, message, &part, bp.children())?;
    }

    t.execute();
    if t.failed() {
        return Err(Error::TransactionFailed(
            t.error().unwrap_or("").to_owned(),
        ));
    }
    Ok(())
}
