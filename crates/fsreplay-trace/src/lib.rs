use std::ffi::CStr;
use std::fmt;
use std::io;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const TRACE_FILENAME: &str = "trace.csv";

const TRACE_HEADER: &str = "Index,Command,ReturnCode,Errno,Extra";

/// Operation kinds as they appear in the `Command` column of a trace.
///
/// A Remove dispatch records as `STAT`, `RMDIR` or `UNLINK` depending on
/// where it resolved; everything else maps one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Mkdir,
    Rmdir,
    Create,
    Close,
    Unlink,
    Stat,
    Hardlink,
    Rename,
    Open,
    Write,
    Read,
    Fsync,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Mkdir => "MKDIR",
            Command::Rmdir => "RMDIR",
            Command::Create => "CREATE",
            Command::Close => "CLOSE",
            Command::Unlink => "UNLINK",
            Command::Stat => "STAT",
            Command::Hardlink => "HARDLINK",
            Command::Rename => "RENAME",
            Command::Open => "OPEN",
            Command::Write => "WRITE",
            Command::Read => "READ",
            Command::Fsync => "FSYNC",
        }
    }

    pub fn parse(label: &str) -> Result<Command> {
        Ok(match label {
            "MKDIR" => Command::Mkdir,
            "RMDIR" => Command::Rmdir,
            "CREATE" => Command::Create,
            "CLOSE" => Command::Close,
            "UNLINK" => Command::Unlink,
            "STAT" => Command::Stat,
            "HARDLINK" => Command::Hardlink,
            "RENAME" => Command::Rename,
            "OPEN" => Command::Open,
            "WRITE" => Command::Write,
            "READ" => Command::Read,
            "FSYNC" => Command::Fsync,
            other => bail!("unknown command label {other:?}"),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// OS error as recorded: the numeric code plus its `strerror` name, rendered
/// `<name>(<code>)` in the trace (`Success(0)` for a clean result).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Errno {
    pub name: String,
    pub code: i32,
}

impl Errno {
    pub fn from_code(code: i32) -> Errno {
        Errno {
            name: strerror(code),
            code,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code)
    }
}

pub fn strerror(code: i32) -> String {
    let ptr = unsafe { libc::strerror(code) };
    if ptr.is_null() {
        return format!("Unknown error {code}");
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// One recorded operation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRow {
    pub index: u32,
    pub command: Command,
    pub return_code: i32,
    pub errno: Errno,
    pub extra: String,
}

/// Ordered, append-only log of operation outcomes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trace {
    pub rows: Vec<TraceRow>,
}

impl Trace {
    pub fn push(&mut self, row: TraceRow) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_csv<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{TRACE_HEADER}")?;
        for row in &self.rows {
            writeln!(
                out,
                "{:>4},{:>12},{:>8},{},{}",
                row.index, row.command, row.return_code, row.errno, row.extra
            )?;
        }
        Ok(())
    }

    pub fn try_parse(text: &str) -> Result<Trace> {
        let lines: Vec<&str> = text.split('\n').collect();
        if lines.len() <= 1 {
            bail!("invalid trace, must not be empty");
        }
        let mut trace = Trace::default();
        for line in &lines[1..] {
            if line.trim().is_empty() {
                break;
            }
            let columns: Vec<&str> = line.split(',').collect();
            if columns.len() != 5 {
                bail!(
                    "invalid trace line {:?}: expected 5 columns, got {}",
                    line,
                    columns.len()
                );
            }
            let index = columns[0]
                .trim()
                .parse()
                .with_context(|| format!("parse index from {:?}", columns[0]))?;
            let command = Command::parse(columns[1].trim())?;
            let return_code = columns[2]
                .trim()
                .parse()
                .with_context(|| format!("parse return code from {:?}", columns[2]))?;
            let errno = parse_errno(columns[3].trim())?;
            let extra = columns[4].trim().to_owned();
            trace.push(TraceRow {
                index,
                command,
                return_code,
                errno,
                extra,
            });
        }
        Ok(trace)
    }

    pub fn same_as(&self, other: &Trace) -> bool {
        self == other
    }

    pub fn has_errors(&self) -> bool {
        self.rows.iter().any(|row| row.errno.code != 0)
    }
}

fn parse_errno(field: &str) -> Result<Errno> {
    let stripped = field
        .strip_suffix(')')
        .with_context(|| format!("invalid errno field {field:?}"))?;
    let (name, code) = stripped
        .rsplit_once('(')
        .with_context(|| format!("invalid errno field {field:?}"))?;
    let code = code
        .parse()
        .with_context(|| format!("parse errno code from {field:?}"))?;
    Ok(Errno {
        name: name.to_owned(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(index: u32, command: Command, return_code: i32, errno_code: i32) -> TraceRow {
        TraceRow {
            index,
            command,
            return_code,
            errno: Errno::from_code(errno_code),
            extra: String::new(),
        }
    }

    #[test]
    fn command_labels_round_trip() {
        let all = [
            Command::Mkdir,
            Command::Rmdir,
            Command::Create,
            Command::Close,
            Command::Unlink,
            Command::Stat,
            Command::Hardlink,
            Command::Rename,
            Command::Open,
            Command::Write,
            Command::Read,
            Command::Fsync,
        ];
        for cmd in all {
            assert_eq!(cmd, Command::parse(cmd.as_str()).unwrap());
        }
        assert!(Command::parse("SYMLINK").is_err());
    }

    #[test]
    fn errno_zero_renders_as_success() {
        assert_eq!("Success(0)", Errno::from_code(0).to_string());
    }

    #[test]
    fn errno_enoent_carries_code() {
        let errno = Errno::from_code(libc::ENOENT);
        assert_eq!(libc::ENOENT, errno.code);
        assert!(errno.to_string().ends_with(&format!("({})", libc::ENOENT)));
    }

    #[test]
    fn empty_input_is_rejected() {
        let err = Trace::try_parse("").unwrap_err();
        assert!(format!("{err:#}").contains("must not be empty"));
    }

    #[test]
    fn header_only_parses_to_no_rows() {
        let trace = Trace::try_parse("Index,Command,ReturnCode,Errno,Extra\n").unwrap();
        assert!(trace.is_empty());
    }

    #[test]
    fn wrong_column_count_is_rejected() {
        let text = "Index,Command,ReturnCode,Errno,Extra\n   0,  MKDIR,       0,Success(0)\n";
        let err = Trace::try_parse(text).unwrap_err();
        assert!(format!("{err:#}").contains("expected 5 columns"));
    }

    #[test]
    fn malformed_errno_is_rejected() {
        let text = "Index,Command,ReturnCode,Errno,Extra\n   0,  MKDIR,       0,Success 0,\n";
        let err = Trace::try_parse(text).unwrap_err();
        assert!(format!("{err:#}").contains("invalid errno field"));
    }

    #[test]
    fn parses_values_and_extra_payload() {
        let text = "Index,Command,ReturnCode,Errno,Extra\n\
                    \x20  0,   READ,      10,Success(0),hash=2f4a\n\
                    \x20  1, UNLINK,      -1,No such file or directory(2),\n";
        let trace = Trace::try_parse(text).unwrap();
        assert_eq!(2, trace.len());
        assert_eq!(Command::Read, trace.rows[0].command);
        assert_eq!(10, trace.rows[0].return_code);
        assert_eq!("hash=2f4a", trace.rows[0].extra);
        assert_eq!(Command::Unlink, trace.rows[1].command);
        assert_eq!(2, trace.rows[1].errno.code);
        assert_eq!("No such file or directory", trace.rows[1].errno.name);
        assert!(trace.has_errors());
    }

    #[test]
    fn csv_round_trip_preserves_rows() {
        let mut trace = Trace::default();
        trace.push(row(0, Command::Mkdir, 0, 0));
        trace.push(row(1, Command::Open, 3, 0));
        trace.push(TraceRow {
            index: 2,
            command: Command::Read,
            return_code: 16,
            errno: Errno::from_code(0),
            extra: "hash=abc123".to_owned(),
        });
        trace.push(row(3, Command::Stat, -1, libc::ENOENT));

        let mut bytes = Vec::new();
        trace.write_csv(&mut bytes).unwrap();
        let parsed = Trace::try_parse(&String::from_utf8(bytes).unwrap()).unwrap();
        assert!(trace.same_as(&parsed));
    }

    #[test]
    fn has_errors_is_false_for_clean_trace() {
        let mut trace = Trace::default();
        trace.push(row(0, Command::Mkdir, 0, 0));
        assert!(!trace.has_errors());
    }
}
