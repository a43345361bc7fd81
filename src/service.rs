//! Wire grammar at the transport boundary: the daemon's first
//! command packet, and the receive side's command/status lines.
//! Socket accept loops and command execution live in the host.

use crate::config::ReceiveConfig;
use crate::errors::{Error, Result};
use crate::object::ObjectId;
use crate::pkt::PacketLineOut;
use std::io::Write;
use std::path::Path;

/// Marker file gating daemon access to a repository.
pub const EXPORT_OK: &str = "git-daemon-export-ok";

/// First packet from a daemon client:
/// `git-upload-pack /path\0host=h\0…`.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceRequest {
    pub service: String,
    pub path: String,
    pub host: Option<String>,
}

pub fn parse_service_request(payload: &[u8]) -> Result<ServiceRequest> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Protocol("request line is not UTF-8".into()))?;
    let (service, rest) = text
        .split_once(' ')
        .ok_or_else(|| Error::Protocol(format!("malformed request {text:?}")))?;
    if !service.starts_with("git-") {
        return Err(Error::Protocol(format!("unknown service {service:?}")));
    }

    let mut fields = rest.split('\0');
    let path = fields
        .next()
        .ok_or_else(|| Error::Protocol("request names no path".into()))?
        .trim_end_matches('\n')
        .to_string();
    check_path(&path)?;

    let mut host = None;
    for field in fields {
        if let Some(h) = field.strip_prefix("host=") {
            host = Some(h.to_string());
        }
    }

    Ok(ServiceRequest {
        service: service.to_string(),
        path,
        host,
    })
}

// Paths that escape the export root are rejected before any
// filesystem access happens.
fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Protocol("empty repository path".into()));
    }
    if path.starts_with("//") {
        return Err(Error::Protocol(format!("invalid path {path:?}")));
    }
    let dotdot = path == ".."
        || path.starts_with("../")
        || path.ends_with("/..")
        || path.contains("/../");
    if dotdot {
        return Err(Error::Protocol(format!("invalid path {path:?}")));
    }
    Ok(())
}

/// Unless the daemon exports everything, a repository must opt in
/// with the marker file.
pub fn check_export_ok(repo_dir: &Path, export_all: bool) -> Result<()> {
    if export_all || repo_dir.join(EXPORT_OK).is_file() {
        Ok(())
    } else {
        Err(Error::not_found(format!(
            "repository {} is not exported",
            repo_dir.display()
        )))
    }
}

/// One `<old> <new> <ref-name>` line of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub old: ObjectId,
    pub new: ObjectId,
    pub name: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Update,
    Delete,
}

impl ReceiveCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split(' ');
        let (old, new, name) = match (fields.next(), fields.next(), fields.next()) {
            (Some(old), Some(new), Some(name)) if !name.is_empty() => (old, new, name),
            _ => return Err(Error::Protocol(format!("malformed command {line:?}"))),
        };
        // the first command may carry a capability list after a NUL
        let name = name.split('\0').next().unwrap_or(name);
        Ok(Self {
            old: ObjectId::from_hex(old.as_bytes())?,
            new: ObjectId::from_hex(new.as_bytes())?,
            name: name.to_string(),
        })
    }

    pub fn kind(&self) -> CommandKind {
        if self.old.is_zero() {
            CommandKind::Create
        } else if self.new.is_zero() {
            CommandKind::Delete
        } else {
            CommandKind::Update
        }
    }

    /// Apply receive policy; `is_ancestor(old, new)` comes from a
    /// revision walker. A rejection reason feeds the `ng` status.
    pub fn check_policy<F>(
        &self,
        config: &ReceiveConfig,
        mut is_ancestor: F,
    ) -> std::result::Result<(), String>
    where
        F: FnMut(&ObjectId, &ObjectId) -> bool,
    {
        match self.kind() {
            CommandKind::Delete if config.deny_deletes => {
                Err("deletion prohibited".to_string())
            }
            CommandKind::Update
                if config.deny_non_fast_forwards && !is_ancestor(&self.old, &self.new) =>
            {
                Err("non-fast-forward".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// `unpack ok` or `unpack <reason>` opens the report-status stream.
pub fn write_unpack_status<W: Write>(
    out: &mut PacketLineOut<W>,
    result: std::result::Result<(), &str>,
) -> Result<()> {
    match result {
        Ok(()) => out.write_text("unpack ok"),
        Err(reason) => out.write_text(&format!("unpack {reason}")),
    }
}

/// Per-ref `ok <ref>` / `ng <ref> <reason>`.
pub fn write_command_status<W: Write>(
    out: &mut PacketLineOut<W>,
    name: &str,
    result: std::result::Result<(), &str>,
) -> Result<()> {
    match result {
        Ok(()) => out.write_text(&format!("ok {name}")),
        Err(reason) => out.write_text(&format!("ng {name} {reason}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{hash_bytes, ObjectKind};
    use crate::pkt::PacketLineIn;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn request_line_parses_service_path_and_host() {
        let req =
            parse_service_request(b"git-upload-pack /projects/app.git\0host=example.com\0")
                .unwrap();
        assert_eq!(req.service, "git-upload-pack");
        assert_eq!(req.path, "/projects/app.git");
        assert_eq!(req.host.as_deref(), Some("example.com"));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        for path in ["//host/share", "/a/../b", "../up", "/x/.."] {
            let line = format!("git-upload-pack {path}\0");
            assert!(matches!(
                parse_service_request(line.as_bytes()),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn unknown_services_are_rejected() {
        assert!(parse_service_request(b"rm -rf /\0").is_err());
    }

    #[test]
    fn export_marker_gates_access() {
        let dir = TempDir::new().unwrap();
        assert!(check_export_ok(dir.path(), false).is_err());
        assert!(check_export_ok(dir.path(), true).is_ok());
        std::fs::write(dir.path().join(EXPORT_OK), b"").unwrap();
        assert!(check_export_ok(dir.path(), false).is_ok());
    }

    #[test]
    fn receive_commands_parse_and_classify() {
        let old = hash_bytes(ObjectKind::Commit, b"old");
        let new = hash_bytes(ObjectKind::Commit, b"new");
        let zero = ObjectId::zero();

        let update =
            ReceiveCommand::parse(&format!("{old} {new} refs/heads/main\0report-status"))
                .unwrap();
        assert_eq!(update.kind(), CommandKind::Update);
        assert_eq!(update.name, "refs/heads/main");

        let create = ReceiveCommand::parse(&format!("{zero} {new} refs/heads/topic")).unwrap();
        assert_eq!(create.kind(), CommandKind::Create);

        let delete = ReceiveCommand::parse(&format!("{old} {zero} refs/heads/gone")).unwrap();
        assert_eq!(delete.kind(), CommandKind::Delete);

        assert!(ReceiveCommand::parse("nonsense").is_err());
    }

    #[test]
    fn receive_policy_applies() {
        let old = hash_bytes(ObjectKind::Commit, b"old");
        let new = hash_bytes(ObjectKind::Commit, b"new");
        let config = ReceiveConfig {
            fsck_objects: false,
            deny_deletes: true,
            deny_non_fast_forwards: true,
        };

        let delete =
            ReceiveCommand::parse(&format!("{old} {} refs/heads/gone", ObjectId::zero()))
                .unwrap();
        assert!(delete.check_policy(&config, |_, _| true).is_err());

        let update = ReceiveCommand::parse(&format!("{old} {new} refs/heads/main")).unwrap();
        assert!(update.check_policy(&config, |_, _| false).is_err());
        assert!(update.check_policy(&config, |_, _| true).is_ok());
    }

    #[test]
    fn report_status_grammar() {
        let mut buf = Vec::new();
        {
            let mut out = PacketLineOut::new(&mut buf);
            write_unpack_status(&mut out, Ok(())).unwrap();
            write_command_status(&mut out, "refs/heads/main", Ok(())).unwrap();
            write_command_status(&mut out, "refs/heads/locked", Err("lock failed")).unwrap();
            out.flush().unwrap();
        }

        let mut input = PacketLineIn::new(Cursor::new(buf));
        assert_eq!(input.read().unwrap().text().unwrap(), b"unpack ok");
        assert_eq!(
            input.read().unwrap().text().unwrap(),
            b"ok refs/heads/main"
        );
        assert_eq!(
            input.read().unwrap().text().unwrap(),
            b"ng refs/heads/locked lock failed"
        );
    }
}
