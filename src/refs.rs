//! Ref names, the remote-tracking namespace and refspecs.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::error::Result;
use crate::id::ObjectId;

pub const REFS_PREFIX: &str = "refs/";
pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
/// Reserved for local copies of remote branches, scoped by remote name.
pub const REMOTES_PREFIX: &str = "refs/remotes/";

/// A named pointer to an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    pub name: String,
    pub target: ObjectId,
}

impl Ref {
    pub fn new(name: impl Into<String>, target: ObjectId) -> Self {
        Ref {
            name: name.into(),
            target,
        }
    }

    pub fn is_head(&self) -> bool {
        self.name.starts_with(HEADS_PREFIX)
    }

    pub fn is_tag(&self) -> bool {
        self.name.starts_with(TAGS_PREFIX)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.target, self.name)
    }
}

/// `refs/heads/<branch>`
pub fn head(branch: &str) -> String {
    format!("{HEADS_PREFIX}{branch}")
}

/// `refs/tags/<tag>`
pub fn tag(name: &str) -> String {
    format!("{TAGS_PREFIX}{name}")
}

/// `refs/remotes/<remote>/`, the prefix holding everything this repository
/// knows about `remote`.
pub fn remote_prefix(remote: &str) -> String {
    format!("{REMOTES_PREFIX}{remote}/")
}

/// `refs/remotes/<remote>/<branch>`
pub fn remote_tracking(remote: &str, branch: &str) -> String {
    format!("{REMOTES_PREFIX}{remote}/{branch}")
}

/// Checks a full ref name, following git's `check-ref-format` rules.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = || Error::InvalidRefName(name.to_owned());
    let Some(rest) = name.strip_prefix(REFS_PREFIX) else {
        return Err(invalid());
    };
    if rest.is_empty() || name.ends_with('/') || name.contains("@{") || name.contains("..") {
        return Err(invalid());
    }
    for component in rest.split('/') {
        if component.is_empty()
            || component.starts_with('.')
            || component.ends_with(".lock")
            || component.ends_with('.')
        {
            return Err(invalid());
        }
    }
    if name
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
    {
        return Err(invalid());
    }
    Ok(())
}

/// Validates a remote name for use inside `refs/remotes/<name>/`.
pub fn validate_remote_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidRefName(name.to_owned()));
    }
    validate_name(&remote_tracking(name, "probe"))
}

/// A mapping between remote and local ref names, `[+]<src>:<dst>`.
///
/// Either both sides carry exactly one `*` or neither does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefSpec {
    pub force: bool,
    pub src: String,
    pub dst: String,
}

impl RefSpec {
    /// `+refs/heads/*:refs/remotes/<remote>/*`
    pub fn default_fetch(remote: &str) -> Self {
        RefSpec {
            force: true,
            src: format!("{HEADS_PREFIX}*"),
            dst: format!("{}*", remote_prefix(remote)),
        }
    }

    /// Maps a source name to its destination, if the spec covers it.
    pub fn map(&self, name: &str) -> Option<String> {
        match self.src.split_once('*') {
            None => (self.src == name).then(|| self.dst.clone()),
            Some((prefix, suffix)) => {
                let middle = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
                if middle.is_empty() {
                    return None;
                }
                let (dprefix, dsuffix) = self.dst.split_once('*')?;
                Some(format!("{dprefix}{middle}{dsuffix}"))
            }
        }
    }

    /// Maps a destination name back to its source.
    pub fn reverse(&self, name: &str) -> Option<String> {
        RefSpec {
            force: self.force,
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
        .map(name)
    }

    /// Whether `name` lies in the destination namespace.
    pub fn covers_destination(&self, name: &str) -> bool {
        self.reverse(name).is_some()
    }
}

impl FromStr for RefSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Config(format!("invalid refspec {s:?}"));
        let (force, body) = match s.strip_prefix('+') {
            Some(body) => (true, body),
            None => (false, s),
        };
        let (src, dst) = body.split_once(':').ok_or_else(bad)?;
        let stars = (src.matches('*').count(), dst.matches('*').count());
        if !matches!(stars, (0, 0) | (1, 1)) {
            return Err(bad());
        }
        for side in [src, dst] {
            validate_name(&side.replace('*', "x")).map_err(|_| bad())?;
        }
        Ok(RefSpec {
            force,
            src: src.to_owned(),
            dst: dst.to_owned(),
        })
    }
}

impl fmt::Display for RefSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.force {
            f.write_str("+")?;
        }
        write!(f, "{}:{}", self.src, self.dst)
    }
}
