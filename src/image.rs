//! Container image references and the runtime naming derived from them.

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::{Result, bail};

const DEFAULT_SERVER: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A `[server/]name[:tag]` container image reference.
///
/// The server is the first slash-separated component only when it contains
/// a dot; bare names come from the default registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ImageReference {
    pub server: String,
    pub name: String,
    pub tag: String,
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // The tag separator is the last ':' past the last '/'; anything
        // before that can be part of a registry port.
        let (rest, tag) = match s.rfind(':') {
            Some(i) if i > s.rfind('/').unwrap_or(0) => (&s[..i], &s[i + 1..]),
            _ => (s, DEFAULT_TAG),
        };
        let (server, name) = match rest.split_once('/') {
            Some((first, remainder)) if first.contains('.') => (first, remainder),
            _ => (DEFAULT_SERVER, rest),
        };
        if name.is_empty() || tag.is_empty() {
            bail!("Malformed image reference {s:?}");
        }
        Ok(ImageReference {
            server: server.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.server, self.name, self.tag)
    }
}

impl ImageReference {
    /// Ref- and filesystem-safe token: percent-encode every byte outside
    /// the unreserved set, with `_` standing in for `%`.
    pub(crate) fn escaped(&self) -> String {
        let mut out = String::new();
        for b in self.to_string().bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'~' | b'-' => {
                    out.push(b as char)
                }
                other => write!(out, "_{other:02X}").unwrap(),
            }
        }
        out
    }

    pub(crate) fn ostree_ref(&self) -> String {
        format!("ociimage/{}", self.escaped())
    }

    /// Reverse-DNS runtime id: the server's dot components reversed, then
    /// the image name, with `/` mapped to `.`.
    pub(crate) fn runtime_id(&self) -> String {
        let mut parts: Vec<&str> = self.server.split('.').collect();
        parts.reverse();
        format!("{}.{}", parts.join("."), self.name.replace('/', "."))
    }

    pub(crate) fn runtime_branch(&self) -> String {
        if self.tag == DEFAULT_TAG {
            "master".to_string()
        } else {
            self.tag.clone()
        }
    }
}

/// Identity of the runtime being produced, after overrides.
#[derive(Clone, Debug)]
pub(crate) struct RuntimeInfo {
    pub id: String,
    pub branch: String,
    pub arch: String,
}

impl RuntimeInfo {
    pub(crate) fn new(
        image: &ImageReference,
        id: Option<String>,
        branch: Option<String>,
        arch: String,
    ) -> Self {
        RuntimeInfo {
            id: id.unwrap_or_else(|| image.runtime_id()),
            branch: branch.unwrap_or_else(|| image.runtime_branch()),
            arch,
        }
    }

    pub(crate) fn full_name(&self) -> String {
        format!("{}/{}/{}", self.id, self.arch, self.branch)
    }

    pub(crate) fn ostree_ref(&self) -> String {
        format!("runtime/{}", self.full_name())
    }
}

/// Map an OCI architecture name to the flatpak one.
pub(crate) fn flatpak_arch(oci_arch: &str) -> Result<&'static str> {
    let arch = match oci_arch {
        "386" => "i386",
        "amd64" => "x86_64",
        "arm" => "arm",
        "arm64" => "aarch64",
        "mips" => "mips",
        "mipsle" => "mipsel",
        "mips64" => "mips64",
        "mips64le" => "mips64el",
        other => bail!("No flatpak architecture corresponds to {other:?}"),
    };
    Ok(arch)
}
