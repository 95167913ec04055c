//! Text persistence of the routing table across restarts.
//!
//! Contacts are written as tagged records, one tag per line, closest to the local identifier
//! first:
//!
//! ```text
//! KUID 5e3b3d6c2b2b0b5a1b3c0e0b3d4f5a6b7c8d9e0f
//! VNDR GTKG
//! VERS 0.1
//! HOST 82.12.1.9:6346
//! SEEN 2026-10-16 08:12:55
//! END
//! ```
//!
//! Blank lines and lines starting with `#` are ignored, as are unknown tags. A record missing a
//! tag, repeating one, or carrying a malformed value is dropped on its own.

use std::{
    io::{self, BufRead, Write},
    net::SocketAddr,
};

use time::{
    format_description::FormatItem, macros::format_description, OffsetDateTime,
    PrimitiveDateTime, UtcOffset,
};
use tracing::{debug, info, trace, warn};

use crate::{
    core::{
        knode::{is_bogon, Knode, Status, VendorCode, Version},
        kuid::Kuid,
    },
    error::{PersistError, RecordError},
    table::RoutingTable,
};

const SEEN_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Writes the contacts as tagged records.
pub fn write_nodes<W: Write>(mut writer: W, nodes: &[Knode]) -> io::Result<()> {
    writeln!(writer, "# Routing table contacts, closest first")?;
    writeln!(writer, "# Saved {}", format_seen(OffsetDateTime::now_utc()))?;

    for kn in nodes {
        writeln!(writer)?;
        writeln!(writer, "KUID {}", kn.id)?;
        writeln!(writer, "VNDR {}", kn.vendor)?;
        writeln!(writer, "VERS {}", kn.version)?;
        writeln!(writer, "HOST {}", kn.addr)?;
        writeln!(writer, "SEEN {}", format_seen(kn.last_seen))?;
        writeln!(writer, "END")?;
    }

    writer.flush()
}

/// Parses tagged records. Invalid records are skipped; only an I/O error or a line cut short
/// aborts the parse.
pub fn parse_nodes<R: BufRead>(mut reader: R) -> Result<Vec<Knode>, PersistError> {
    let mut nodes = Vec::new();
    let mut record = Record::default();
    let mut line = String::new();
    let mut line_no = 0;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        line_no += 1;

        if !line.ends_with('\n') {
            return Err(PersistError::Truncated { line: line_no });
        }

        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        let (tag, value) = match text.split_once(char::is_whitespace) {
            Some((tag, value)) => (tag, value.trim()),
            None => (text, ""),
        };

        if tag == "END" {
            match std::mem::take(&mut record).finish() {
                Ok(kn) => nodes.push(kn),
                Err(e) => warn!(line = line_no, "discarding persisted contact: {e}"),
            }
            continue;
        }

        record.set(tag, value);
    }

    if record.touched {
        warn!("discarding unterminated record at end of input");
    }

    Ok(nodes)
}

fn format_seen(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(SEEN_FORMAT)
        .unwrap_or_default()
}

#[derive(Debug, Default)]
struct Record {
    kuid: Option<Kuid>,
    vendor: Option<VendorCode>,
    version: Option<Version>,
    host: Option<SocketAddr>,
    seen: Option<OffsetDateTime>,
    // The first problem found, the rest of the record is then ignored.
    error: Option<RecordError>,
    touched: bool,
}

impl Record {
    fn set(&mut self, tag: &str, value: &str) {
        self.touched = true;
        if self.error.is_some() {
            return;
        }

        let result = match tag {
            "KUID" => fill(&mut self.kuid, "KUID", value, |v| v.parse().ok()),
            "VNDR" => fill(&mut self.vendor, "VNDR", value, VendorCode::parse),
            "VERS" => fill(&mut self.version, "VERS", value, Version::parse),
            "HOST" => fill(&mut self.host, "HOST", value, |v| v.parse().ok()),
            "SEEN" => fill(&mut self.seen, "SEEN", value, |v| {
                PrimitiveDateTime::parse(v, SEEN_FORMAT)
                    .ok()
                    .map(PrimitiveDateTime::assume_utc)
            }),
            _ => {
                trace!(tag, "ignoring unknown tag");
                Ok(())
            }
        };

        if let Err(e) = result {
            self.error = Some(e);
        }
    }

    fn finish(self) -> Result<Knode, RecordError> {
        if let Some(e) = self.error {
            return Err(e);
        }

        let id = self.kuid.ok_or(RecordError::Missing("KUID"))?;
        let vendor = self.vendor.ok_or(RecordError::Missing("VNDR"))?;
        let version = self.version.ok_or(RecordError::Missing("VERS"))?;
        let host = self.host.ok_or(RecordError::Missing("HOST"))?;
        let seen = self.seen.ok_or(RecordError::Missing("SEEN"))?;

        if is_bogon(&host) {
            return Err(RecordError::Unusable(host));
        }

        Ok(Knode::new(id, host)
            .with_vendor(vendor)
            .with_version(version)
            .with_last_seen(seen))
    }
}

fn fill<T>(
    slot: &mut Option<T>,
    tag: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<(), RecordError> {
    if slot.is_some() {
        return Err(RecordError::Duplicate(tag));
    }

    let parsed = parse(value).ok_or_else(|| RecordError::Malformed(tag, value.to_owned()))?;
    *slot = Some(parsed);

    Ok(())
}

impl RoutingTable {
    /// Returns the contacts worth persisting, closest to the local identifier first: good ones and
    /// stale ones that haven't missed an RPC yet.
    pub fn persistable_nodes(&self) -> Vec<Knode> {
        let mut nodes: Vec<Knode> = self
            .nodes()
            .filter(|kn| {
                kn.status == Status::Good || (kn.status == Status::Stale && kn.rpc_timeouts == 0)
            })
            .cloned()
            .collect();

        let local_id = self.local_id();
        nodes.sort_by(|a, b| local_id.cmp_distance(&a.id, &b.id));

        nodes
    }

    /// Saves the table, returning the number of contacts written.
    pub fn save<W: Write>(&self, writer: W) -> io::Result<usize> {
        let nodes = self.persistable_nodes();
        write_nodes(writer, &nodes)?;

        info!(count = nodes.len(), "saved routing table");
        Ok(nodes.len())
    }

    /// Restores contacts saved by [`RoutingTable::save`], closest first so the buckets around the
    /// local identifier are filled before the distant ones. Returns the number of contacts added.
    ///
    /// A damaged file is not fatal: whatever can't be read is dropped and the table starts with
    /// what was recovered, possibly nothing.
    pub fn load<R: BufRead>(&mut self, reader: R) -> usize {
        let mut nodes = match parse_nodes(reader) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("not restoring routing table: {e}");
                return 0;
            }
        };

        let local_id = self.local_id();
        nodes.sort_by(|a, b| local_id.cmp_distance(&a.id, &b.id));

        let mut added = 0;
        for mut kn in nodes {
            if self.config().hostiles.contains(&kn.addr.ip()) {
                debug!(addr = %kn.addr, "skipping hostile persisted contact");
                continue;
            }

            kn.flags.cached = true;
            if self.add_node(kn, false).is_added() {
                added += 1;
            }
        }

        info!(added, "restored routing table");
        added
    }
}
