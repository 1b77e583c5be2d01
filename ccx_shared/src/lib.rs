use base64::prelude::*;
use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
};

pub mod paths {
    use std::path::PathBuf;

    pub const DEFAULT_SOCKET_PATH: &str = "~/.cache/ccx/ccx.sock";

    pub fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(path)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn expands_leading_tilde_against_home() {
            // SAFETY: test runs single-threaded w.r.t. this env var and restores it.
            let previous = std::env::var_os("HOME");
            unsafe {
                std::env::set_var("HOME", "/home/dev");
            }
            assert_eq!(expand_tilde("~/.cache/ccx"), PathBuf::from("/home/dev/.cache/ccx"));
            if let Some(previous) = previous {
                unsafe {
                    std::env::set_var("HOME", previous);
                }
            }
        }

        #[test]
        fn leaves_absolute_paths_unchanged() {
            assert_eq!(expand_tilde("/tmp/ccx.sock"), PathBuf::from("/tmp/ccx.sock"));
        }
    }
}

// Strings here are base64 of the raw OsString bytes so non-UTF8 paths and
// arguments survive the trip.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct RunRequestDataWire {
    pub binary: CompilerKind,
    pub args: Vec<String>,
    pub cwd: String,
    pub env_path: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct RunResponseDataWire {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

pub const DEFAULT_PORT: u16 = 6390;

#[derive(Debug, Clone)]
pub struct RunRequestData {
    pub binary: CompilerKind,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    // PATH as seen by the client process, needed to resolve a local compiler
    // the same way the shell that invoked the client would.
    pub env_path: Option<OsString>,
}

#[derive(Debug, Clone)]
pub struct RunResponseData {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum CompilerKind {
    Gcc,
    Gxx,
    Clang,
    Clangxx,
    ClCl,
    ClangCl,
    Javac,
    Java,
    ClangTidy,
    Ar,
}

impl CompilerKind {
    pub fn to_standard_binary_name(&self) -> OsString {
        match self {
            CompilerKind::Gcc => "gcc".into(),
            CompilerKind::Gxx => "g++".into(),
            CompilerKind::Clang => "clang".into(),
            CompilerKind::Clangxx => "clang++".into(),
            CompilerKind::ClCl => "cl.exe".into(),
            CompilerKind::ClangCl => "clang-cl".into(),
            CompilerKind::Javac => "javac".into(),
            CompilerKind::Java => "java".into(),
            CompilerKind::ClangTidy => "clang-tidy".into(),
            CompilerKind::Ar => "ar".into(),
        }
    }

    pub fn from_standard_binary_name(binary_name: &OsStr) -> Option<Self> {
        match binary_name.to_str() {
            Some("gcc") => Some(CompilerKind::Gcc),
            Some("g++") => Some(CompilerKind::Gxx),
            Some("clang") => Some(CompilerKind::Clang),
            Some("clang++") => Some(CompilerKind::Clangxx),
            Some("cl.exe") | Some("cl") => Some(CompilerKind::ClCl),
            Some("clang-cl") => Some(CompilerKind::ClangCl),
            Some("javac") => Some(CompilerKind::Javac),
            Some("java") => Some(CompilerKind::Java),
            Some("clang-tidy") => Some(CompilerKind::ClangTidy),
            Some("ar") => Some(CompilerKind::Ar),
            _ => None,
        }
    }

    // cl.exe-compatible compilers produce COFF objects with an embedded
    // build timestamp the commit pipeline has to rewrite on a cache hit.
    pub fn is_coff_producing(&self) -> bool {
        matches!(self, CompilerKind::ClCl | CompilerKind::ClangCl)
    }

    pub fn is_archiver(&self) -> bool {
        matches!(self, CompilerKind::Ar)
    }
}

impl RunRequestData {
    pub fn to_wire(self) -> RunRequestDataWire {
        RunRequestDataWire {
            binary: self.binary,
            cwd: encode_osstr(self.cwd.into_os_string()),
            args: self.args.into_iter().map(encode_osstr).collect(),
            env_path: self.env_path.map(encode_osstr),
        }
    }

    pub fn from_wire(wire: &RunRequestDataWire) -> Result<Self, base64::DecodeError> {
        Ok(Self {
            binary: wire.binary,
            cwd: decode_osstr(&wire.cwd)?.into(),
            args: wire
                .args
                .iter()
                .map(|s| decode_osstr(s))
                .collect::<Result<_, _>>()?,
            env_path: wire.env_path.as_deref().map(decode_osstr).transpose()?,
        })
    }
}

impl RunResponseData {
    pub fn to_wire(self) -> RunResponseDataWire {
        RunResponseDataWire {
            stdout: BASE64_STANDARD.encode(&self.stdout),
            stderr: BASE64_STANDARD.encode(&self.stderr),
            status: self.status,
        }
    }

    pub fn from_wire(wire: RunResponseDataWire) -> Result<Self, base64::DecodeError> {
        Ok(Self {
            stdout: BASE64_STANDARD.decode(wire.stdout)?,
            stderr: BASE64_STANDARD.decode(wire.stderr)?,
            status: wire.status,
        })
    }
}

fn encode_osstr(s: OsString) -> String {
    BASE64_STANDARD.encode(s.as_encoded_bytes())
}

fn decode_osstr(s: &str) -> Result<OsString, base64::DecodeError> {
    // SAFETY: It is expected that the string had been encoded on the same system.
    Ok(unsafe { OsString::from_encoded_bytes_unchecked(BASE64_STANDARD.decode(s)?) })
}
