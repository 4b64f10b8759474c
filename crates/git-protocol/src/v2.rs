//! Protocol v2 implementation.
//!
//! Protocol v2 uses a command-based architecture:
//! - `ls-refs`: List references with server-side filtering
//! - `fetch`: Fetch objects with incremental negotiation

use bstr::BString;
use git_hash::ObjectId;

use crate::capability::Capabilities;
use crate::pktline::{PktLine, PktLineReader, PktLineWriter};
use crate::ProtocolError;

/// V2 commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Command {
    LsRefs,
    Fetch,
}

impl V2Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            V2Command::LsRefs => "ls-refs",
            V2Command::Fetch => "fetch",
        }
    }
}

/// Options for ls-refs command.
#[derive(Debug, Clone, Default)]
pub struct LsRefsOptions {
    /// Ref prefixes to filter by (server-side filtering).
    pub ref_prefixes: Vec<String>,
    /// Whether to include symrefs in output.
    pub symrefs: bool,
    /// Whether to include peeled OIDs.
    pub peel: bool,
}

/// Perform a v2 ls-refs command.
pub fn ls_refs<W: std::io::Write, R: std::io::Read>(
    writer: &mut PktLineWriter<W>,
    reader: &mut PktLineReader<R>,
    options: &LsRefsOptions,
) -> Result<Vec<(ObjectId, BString)>, ProtocolError> {
    // Send command
    writer.write_text("command=ls-refs")?;
    writer.write_delimiter()?;

    // Send arguments
    if options.symrefs {
        writer.write_text("symrefs")?;
    }
    if options.peel {
        writer.write_text("peel")?;
    }
    for prefix in &options.ref_prefixes {
        writer.write_text(&format!("ref-prefix {}", prefix))?;
    }
    writer.write_flush()?;
    writer.flush()?;

    // Read response
    let mut refs = Vec::new();
    loop {
        match reader.read_pkt()? {
            PktLine::Flush | PktLine::ResponseEnd => break,
            PktLine::Delimiter => break,
            PktLine::Data(data) => {
                let line = strip_newline(&data);
                // Format: <oid> <refname> [symref-target:<target>] [peeled:<oid>]
                let line_str = std::str::from_utf8(line).map_err(|_| {
                    ProtocolError::Protocol("invalid UTF-8 in ls-refs response".into())
                })?;

                let parts: Vec<&str> = line_str.splitn(3, ' ').collect();
                if parts.len() < 2 {
                    continue;
                }

                let oid = ObjectId::from_hex(parts[0]).map_err(|e| {
                    ProtocolError::Protocol(format!("invalid OID in ls-refs: {}", e))
                })?;
                let refname = parts[1];
                refs.push((oid, BString::from(refname.as_bytes())));
            }
        }
    }

    Ok(refs)
}

/// Options for v2 fetch command.
#[derive(Debug, Clone, Default)]
pub struct V2FetchOptions {
    /// Object IDs the client wants.
    pub wants: Vec<ObjectId>,
    /// Ref names the client wants by name (server resolves to an id),
    /// requires the server to advertise `fetch=...want-ref`.
    pub want_refs: Vec<String>,
    /// Object IDs the client already has.
    pub haves: Vec<ObjectId>,
    /// Whether to signal "done" (no more haves).
    pub done: bool,
    /// Depth limit for shallow fetch.
    pub depth: Option<u32>,
    /// Shallow since a given date (ISO 8601 or unix timestamp).
    pub deepen_since: Option<String>,
    /// Deepen excluding history reachable from this ref/oid.
    pub deepen_not: Option<String>,
    /// Interpret `deepen` relative to the client's existing shallow boundary.
    pub deepen_relative: bool,
    /// Filter expression (e.g., "blob:none").
    pub filter: Option<String>,
    /// Whether to include tags.
    pub include_tag: bool,
    /// Thin pack.
    pub thin_pack: bool,
    /// Ofs-delta.
    pub ofs_delta: bool,
    /// Demand every packfile band (even progress/error) get an explicit
    /// sideband channel instead of being interleaved unframed.
    pub sideband_all: bool,
    /// Accept pack data delivered out-of-band as `packfile-uris` instead of
    /// inline in the response.
    pub packfile_uris: Vec<String>,
    /// Tell the server not to send the packfile until the client's `done`
    /// arrives, even if the server thinks it already has enough haves.
    pub wait_for_done: bool,
    /// Opaque `server-option=<value>` arguments, forwarded verbatim.
    pub server_options: Vec<String>,
    /// Client-generated session id, echoed in server-side telemetry/logs.
    pub session_id: Option<String>,
}

/// Result of a v2 fetch command.
#[derive(Debug, Default)]
pub struct V2FetchResult {
    /// Acknowledgments from the server.
    pub acks: Vec<ObjectId>,
    /// Whether the server is ready to send the pack.
    pub ready: bool,
    /// Pack data (if ready).
    pub pack_data: Vec<u8>,
    /// Shallow boundary updates.
    pub shallow: Vec<ObjectId>,
    pub unshallow: Vec<ObjectId>,
    /// `wanted-refs` section: ref name to resolved id, for `want-ref` requests.
    pub wanted_refs: Vec<(String, ObjectId)>,
    /// `packfile-uris` section: out-of-band pack URIs the client must also fetch.
    pub packfile_uris: Vec<String>,
}

/// Perform a v2 fetch command.
pub fn fetch_v2<W: std::io::Write, R: std::io::Read>(
    writer: &mut PktLineWriter<W>,
    reader: &mut PktLineReader<R>,
    options: &V2FetchOptions,
    server_caps: &Capabilities,
) -> Result<V2FetchResult, ProtocolError> {
    // Send command
    writer.write_text("command=fetch")?;

    // Send capability list
    if server_caps.get("fetch").is_some() {
        writer.write_text("agent=knit/0.1")?;
    }
    writer.write_delimiter()?;

    // Send arguments
    if options.thin_pack {
        writer.write_text("thin-pack")?;
    }
    if options.ofs_delta {
        writer.write_text("ofs-delta")?;
    }
    if options.include_tag {
        writer.write_text("include-tag")?;
    }
    if options.sideband_all {
        writer.write_text("sideband-all")?;
    }
    if options.wait_for_done {
        writer.write_text("wait-for-done")?;
    }
    if let Some(ref session_id) = options.session_id {
        writer.write_text(&format!("session-id={}", session_id))?;
    }
    for opt in &options.server_options {
        writer.write_text(&format!("server-option={}", opt))?;
    }

    for want in &options.wants {
        writer.write_text(&format!("want {}", want))?;
    }
    for want_ref in &options.want_refs {
        writer.write_text(&format!("want-ref {}", want_ref))?;
    }

    for have in &options.haves {
        writer.write_text(&format!("have {}", have))?;
    }

    if let Some(depth) = options.depth {
        writer.write_text(&format!("deepen {}", depth))?;
    }
    if let Some(ref since) = options.deepen_since {
        writer.write_text(&format!("deepen-since {}", since))?;
    }
    if let Some(ref exclude) = options.deepen_not {
        writer.write_text(&format!("deepen-not {}", exclude))?;
    }
    if options.deepen_relative {
        writer.write_text("deepen-relative")?;
    }

    if let Some(ref filter) = options.filter {
        writer.write_text(&format!("filter {}", filter))?;
    }

    for uri in &options.packfile_uris {
        writer.write_text(&format!("packfile-uris {}", uri))?;
    }

    if options.done {
        writer.write_text("done")?;
    }

    writer.write_flush()?;
    writer.flush()?;

    // Read response sections
    let mut result = V2FetchResult::default();

    // Read section by section
    loop {
        match reader.read_pkt()? {
            PktLine::Flush | PktLine::ResponseEnd => break,
            PktLine::Delimiter => continue,
            PktLine::Data(data) => {
                let line = strip_newline(&data);
                let line_str = String::from_utf8_lossy(line);

                if line_str == "acknowledgments" || line_str == "packfile"
                    || line_str == "shallow-info" || line_str == "wanted-refs"
                    || line_str == "packfile-uris"
                {
                    // Section header â€” read section contents
                    let section = line_str.to_string();
                    read_v2_section(reader, &section, &mut result)?;
                } else if line_str.starts_with("ACK ") {
                    if let Some(oid_str) = line_str.strip_prefix("ACK ") {
                        if let Ok(oid) = ObjectId::from_hex(oid_str.trim()) {
                            result.acks.push(oid);
                        }
                    }
                } else if line_str == "ready" {
                    result.ready = true;
                } else if line_str == "NAK" {
                    // No common objects
                }
            }
        }
    }

    Ok(result)
}

fn read_v2_section<R: std::io::Read>(
    reader: &mut PktLineReader<R>,
    section: &str,
    result: &mut V2FetchResult,
) -> Result<(), ProtocolError> {
    loop {
        match reader.read_pkt()? {
            PktLine::Flush | PktLine::ResponseEnd => return Ok(()),
            PktLine::Delimiter => return Ok(()),
            PktLine::Data(data) => {
                let line = strip_newline(&data);
                let line_str = String::from_utf8_lossy(line);

                match section {
                    "acknowledgments" => {
                        if line_str.starts_with("ACK ") {
                            if let Some(oid_str) = line_str.strip_prefix("ACK ") {
                                if let Ok(oid) = ObjectId::from_hex(oid_str.trim()) {
                                    result.acks.push(oid);
                                }
                            }
                        } else if line_str == "ready" {
                            result.ready = true;
                        }
                    }
                    "packfile" => {
                        // Packfile data is sideband-multiplexed
                        if !data.is_empty() {
                            let band = data[0];
                            if band == 1 {
                                result.pack_data.extend_from_slice(&data[1..]);
                            }
                            // band 2 = progress, band 3 = error
                        }
                    }
                    "shallow-info" => {
                        if let Some(oid_str) = line_str.strip_prefix("shallow ") {
                            if let Ok(oid) = ObjectId::from_hex(oid_str.trim()) {
                                result.shallow.push(oid);
                            }
                        } else if let Some(oid_str) = line_str.strip_prefix("unshallow ") {
                            if let Ok(oid) = ObjectId::from_hex(oid_str.trim()) {
                                result.unshallow.push(oid);
                            }
                        }
                    }
                    "wanted-refs" => {
                        // "<oid> <refname>"
                        if let Some((oid_str, name)) = line_str.split_once(' ') {
                            if let Ok(oid) = ObjectId::from_hex(oid_str.trim()) {
                                result.wanted_refs.push((name.to_string(), oid));
                            }
                        }
                    }
                    "packfile-uris" => {
                        result.packfile_uris.push(line_str.to_string());
                    }
                    _ => {}
                }
            }
        }
    }
}

fn strip_newline(data: &[u8]) -> &[u8] {
    if data.last() == Some(&b'\n') {
        &data[..data.len() - 1]
    } else {
        data
    }
}
