//! Stream redirection and parent-side pipe ends.

use super::error::ProcessError;
use super::output::{DecodeErrors, decode_text};
use super::sys;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, LineWriter, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Standard I/O configuration for child processes.
///
/// Configures how the child's stdin, stdout, and stderr are handled.
#[derive(Debug, Clone, Default)]
pub enum Stdio {
    /// Inherit from the parent process.
    #[default]
    Inherit,

    /// Create a pipe to/from the child process.
    ///
    /// For stdin, the parent can write to the child.
    /// For stdout/stderr, the parent can read from the child.
    Pipe,

    /// Discard (redirect to /dev/null).
    ///
    /// For stdin, the child will read EOF immediately.
    /// For stdout/stderr, the output is discarded.
    Null,

    /// Send stderr wherever stdout goes. Only meaningful for stderr.
    MergeStdout,

    /// A descriptor handed over by the caller.
    ///
    /// Each spawn gives the child its own duplicate. The descriptor itself
    /// stays open until the last clone of this value (and of any `Command`
    /// holding it) is dropped.
    Fd(Arc<OwnedFd>),
}

impl Stdio {
    /// Creates an `Inherit` configuration.
    #[must_use]
    pub fn inherit() -> Self {
        Self::Inherit
    }

    /// Creates a `Pipe` configuration.
    #[must_use]
    pub fn piped() -> Self {
        Self::Pipe
    }

    /// Creates a `Null` configuration.
    #[must_use]
    pub fn null() -> Self {
        Self::Null
    }

    /// Creates a `MergeStdout` configuration.
    #[must_use]
    pub fn merge_stdout() -> Self {
        Self::MergeStdout
    }

    /// Redirects to `fd`, taking ownership of it.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let log = File::create("build.log")?;
    /// Command::new("make").stdout(Stdio::fd(log)).spawn()?;
    /// ```
    #[must_use]
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Self::Fd(Arc::new(fd.into()))
    }

    /// Redirects to a duplicate of a descriptor the caller keeps, such as
    /// `io::stderr()`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be duplicated.
    pub fn dup(fd: impl AsFd) -> io::Result<Self> {
        Ok(Self::fd(fd.as_fd().try_clone_to_owned()?))
    }
}

impl From<OwnedFd> for Stdio {
    fn from(fd: OwnedFd) -> Self {
        Self::fd(fd)
    }
}

impl From<File> for Stdio {
    fn from(file: File) -> Self {
        Self::fd(file)
    }
}

/// Buffering of the parent's pipe ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Buffering {
    /// The standard library's default buffer size.
    #[default]
    Default,
    /// Every write goes straight to the pipe.
    Unbuffered,
    /// Writes to stdin are flushed at each newline.
    Line,
    /// Buffer of the given size.
    Full(usize),
}

impl Buffering {
    fn capacity(self) -> Option<usize> {
        match self {
            Self::Default | Self::Line => None,
            Self::Unbuffered => Some(0),
            Self::Full(size) => Some(size),
        }
    }
}

/// Descriptors for one spawn: what the child gets on 0/1/2, and the ends
/// the parent keeps.
///
/// Everything is owned, so an early return anywhere between pipe creation
/// and a successful spawn closes every descriptor allocated so far.
#[derive(Debug, Default)]
pub(crate) struct Plumbing {
    /// Child-side ends and duplicates, closed in the parent after spawn.
    child_side: Vec<OwnedFd>,
    targets: [Option<RawFd>; 3],
    parent: [Option<OwnedFd>; 3],
}

impl Plumbing {
    /// Allocates pipes and duplicates for the three requests.
    pub(crate) fn build(stdin: Stdio, stdout: Stdio, stderr: Stdio) -> Result<Self, ProcessError> {
        if matches!(stdin, Stdio::MergeStdout) || matches!(stdout, Stdio::MergeStdout) {
            return Err(ProcessError::Usage(
                "MergeStdout is only valid for stderr".into(),
            ));
        }

        let mut plumbing = Self::default();
        let mut devnull: Option<RawFd> = None;

        for (slot, request) in [stdin, stdout, stderr].into_iter().enumerate() {
            let target = match request {
                Stdio::Inherit => None,
                Stdio::Pipe => {
                    let (read, write) = sys::cloexec_pipe()?;
                    let (child, parent) = if slot == 0 { (read, write) } else { (write, read) };
                    plumbing.parent[slot] = Some(parent);
                    Some(plumbing.keep(sys::raise_above_stdio(child)?))
                }
                Stdio::Null => match devnull {
                    Some(fd) => Some(fd),
                    None => {
                        let fd = plumbing.keep(sys::open_devnull()?);
                        devnull = Some(fd);
                        Some(fd)
                    }
                },
                Stdio::MergeStdout => match plumbing.targets[1] {
                    Some(fd) => Some(fd),
                    None => Some(plumbing.keep(sys::dup_above_stdio(io::stdout().as_fd())?)),
                },
                Stdio::Fd(fd) => Some(plumbing.keep(sys::dup_above_stdio(fd.as_fd())?)),
            };
            plumbing.targets[slot] = target;
        }
        Ok(plumbing)
    }

    fn keep(&mut self, fd: OwnedFd) -> RawFd {
        let raw = fd.as_raw_fd();
        self.child_side.push(fd);
        raw
    }

    /// Descriptors to install as 0, 1, 2 in the child.
    pub(crate) fn targets(&self) -> [Option<RawFd>; 3] {
        self.targets
    }

    /// Closes the child-side descriptors and hands over the parent ends.
    pub(crate) fn into_parent(self) -> [Option<OwnedFd>; 3] {
        drop(self.child_side);
        self.parent
    }
}

#[derive(Debug)]
enum Writer {
    Direct(File),
    Line(LineWriter<File>),
    Buffered(BufWriter<File>),
}

/// Parent's end of the child's stdin.
#[derive(Debug)]
pub struct ChildStdin {
    inner: Writer,
}

impl ChildStdin {
    pub(crate) fn new(fd: OwnedFd, buffering: Buffering) -> Self {
        let file = File::from(fd);
        let inner = match buffering {
            Buffering::Unbuffered => Writer::Direct(file),
            Buffering::Line => Writer::Line(LineWriter::new(file)),
            other => match other.capacity() {
                Some(cap) if cap > 0 => Writer::Buffered(BufWriter::with_capacity(cap, file)),
                _ => Writer::Buffered(BufWriter::new(file)),
            },
        };
        Self { inner }
    }

    pub(crate) fn get_ref(&self) -> &File {
        match &self.inner {
            Writer::Direct(file) => file,
            Writer::Line(w) => w.get_ref(),
            Writer::Buffered(w) => w.get_ref(),
        }
    }
}

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Writer::Direct(file) => file.write(buf),
            Writer::Line(w) => w.write(buf),
            Writer::Buffered(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Writer::Direct(file) => file.flush(),
            Writer::Line(w) => w.flush(),
            Writer::Buffered(w) => w.flush(),
        }
    }
}

impl AsRawFd for ChildStdin {
    fn as_raw_fd(&self) -> RawFd {
        self.get_ref().as_raw_fd()
    }
}

impl AsFd for ChildStdin {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.get_ref().as_fd()
    }
}

macro_rules! reader_end {
    ($name:ident, $stream:literal) => {
        #[doc = concat!("Parent's end of the child's ", $stream, ".")]
        ///
        /// [`Read`] and [`BufRead`] yield the raw bytes. The `*_text`
        /// methods decode with the command's [`errors`](super::Command::errors)
        /// policy and normalize `\r\n` and lone `\r` to `\n`.
        #[derive(Debug)]
        pub struct $name {
            inner: BufReader<File>,
            text: Option<DecodeErrors>,
        }

        impl $name {
            pub(crate) fn new(fd: OwnedFd, buffering: Buffering, text: Option<DecodeErrors>) -> Self {
                let file = File::from(fd);
                let inner = match buffering.capacity() {
                    Some(cap) => BufReader::with_capacity(cap, file),
                    None => BufReader::new(file),
                };
                Self { inner, text }
            }

            /// True if the command was spawned in text mode.
            #[must_use]
            pub fn is_text(&self) -> bool {
                self.text.is_some()
            }

            fn errors(&self) -> DecodeErrors {
                self.text.unwrap_or_default()
            }

            /// Reads to EOF and decodes everything.
            ///
            /// # Errors
            ///
            /// I/O errors, or [`ProcessError::Decode`] under the strict
            /// policy.
            pub fn read_text(&mut self) -> Result<String, ProcessError> {
                let mut data = Vec::new();
                self.inner.read_to_end(&mut data)?;
                decode_text(data, self.errors())
            }

            /// Reads one line, terminator included. `None` at EOF.
            ///
            /// `\n`, `\r\n` and a lone `\r` all end a line and come back
            /// as `\n`.
            ///
            /// # Errors
            ///
            /// As [`read_text`](Self::read_text).
            pub fn read_text_line(&mut self) -> Result<Option<String>, ProcessError> {
                let mut line = Vec::new();
                loop {
                    let available = match self.inner.fill_buf() {
                        Ok(available) => available,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err.into()),
                    };
                    if available.is_empty() {
                        break;
                    }
                    match available.iter().position(|&b| b == b'\n' || b == b'\r') {
                        Some(end) => {
                            let carriage_return = available[end] == b'\r';
                            line.extend_from_slice(&available[..=end]);
                            self.inner.consume(end + 1);
                            if carriage_return {
                                self.skip_line_feed()?;
                            }
                            break;
                        }
                        None => {
                            let len = available.len();
                            line.extend_from_slice(available);
                            self.inner.consume(len);
                        }
                    }
                }
                if line.is_empty() {
                    return Ok(None);
                }
                decode_text(line, self.errors()).map(Some)
            }

            /// Iterator over [`read_text_line`](Self::read_text_line).
            pub fn text_lines(&mut self) -> impl Iterator<Item = Result<String, ProcessError>> + '_ {
                std::iter::from_fn(move || self.read_text_line().transpose())
            }

            fn skip_line_feed(&mut self) -> io::Result<()> {
                if self.inner.fill_buf()?.first() == Some(&b'\n') {
                    self.inner.consume(1);
                }
                Ok(())
            }

            /// Removes and returns bytes read ahead into the buffer.
            pub(crate) fn take_buffered(&mut self) -> Vec<u8> {
                let data = self.inner.buffer().to_vec();
                self.inner.consume(data.len());
                data
            }

            pub(crate) fn get_ref(&self) -> &File {
                self.inner.get_ref()
            }
        }

        impl Read for $name {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.inner.read(buf)
            }
        }

        impl BufRead for $name {
            fn fill_buf(&mut self) -> io::Result<&[u8]> {
                self.inner.fill_buf()
            }

            fn consume(&mut self, amt: usize) {
                self.inner.consume(amt);
            }
        }

        impl AsRawFd for $name {
            fn as_raw_fd(&self) -> RawFd {
                self.inner.get_ref().as_raw_fd()
            }
        }

        impl AsFd for $name {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.inner.get_ref().as_fd()
            }
        }
    };
}

reader_end!(ChildStdout, "stdout");
reader_end!(ChildStderr, "stderr");

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn null_streams_share_one_descriptor() {
        init_test("null_streams_share_one_descriptor");
        let plumbing = Plumbing::build(Stdio::Null, Stdio::Null, Stdio::Null).expect("build");
        let targets = plumbing.targets();
        crate::assert_with_log!(
            targets[0] == targets[1] && targets[1] == targets[2],
            "shared devnull",
            targets[0],
            targets
        );
        crate::assert_with_log!(
            plumbing.child_side.len() == 1,
            "one open",
            1,
            plumbing.child_side.len()
        );
        crate::test_complete!("null_streams_share_one_descriptor");
    }

    #[test]
    fn merge_follows_stdout_pipe() {
        init_test("merge_follows_stdout_pipe");
        let plumbing =
            Plumbing::build(Stdio::Inherit, Stdio::Pipe, Stdio::MergeStdout).expect("build");
        let targets = plumbing.targets();
        crate::assert_with_log!(
            targets[2] == targets[1] && targets[1].is_some(),
            "stderr to stdout pipe",
            targets[1],
            targets[2]
        );
        crate::assert_with_log!(targets[0].is_none(), "stdin inherited", None::<RawFd>, targets[0]);
        let parent = plumbing.into_parent();
        crate::assert_with_log!(
            parent[1].is_some() && parent[2].is_none(),
            "only stdout has a parent end",
            "[None, Some, None]",
            parent
        );
        crate::test_complete!("merge_follows_stdout_pipe");
    }

    #[test]
    fn merge_rejected_for_stdout() {
        init_test("merge_rejected_for_stdout");
        let result = Plumbing::build(Stdio::Inherit, Stdio::MergeStdout, Stdio::Inherit);
        crate::assert_with_log!(
            matches!(result, Err(ProcessError::Usage(_))),
            "usage error",
            "Usage",
            result
        );
        crate::test_complete!("merge_rejected_for_stdout");
    }

    #[test]
    fn caller_fd_is_duplicated_and_outlives_spawn() {
        init_test("caller_fd_is_duplicated_and_outlives_spawn");
        let file = tempfile::tempfile().expect("tempfile");
        let stdio = Stdio::fd(file);
        let Stdio::Fd(owned) = &stdio else {
            panic!("expected Stdio::Fd, got {stdio:?}");
        };
        let original = owned.as_raw_fd();

        let plumbing = Plumbing::build(Stdio::Inherit, stdio.clone(), Stdio::Inherit).expect("build");
        let target = plumbing.targets()[1];
        crate::assert_with_log!(
            target.is_some_and(|fd| fd > 2 && fd != original),
            "private duplicate above stdio",
            "> 2",
            target
        );
        drop(plumbing.into_parent());

        let still_open = nix::fcntl::fcntl(original, nix::fcntl::FcntlArg::F_GETFD);
        crate::assert_with_log!(still_open.is_ok(), "caller fd open", "Ok", still_open);

        let borrowed = Stdio::dup(io::stderr()).expect("dup stderr");
        let plumbing = Plumbing::build(borrowed, Stdio::Inherit, Stdio::Inherit).expect("build");
        let target = plumbing.targets()[0];
        crate::assert_with_log!(target.is_some_and(|fd| fd > 2), "raised above stdio", "> 2", target);
        crate::test_complete!("caller_fd_is_duplicated_and_outlives_spawn");
    }

    #[test]
    fn text_lines_normalize_every_terminator() {
        init_test("text_lines_normalize_every_terminator");
        let (read, write) = sys::cloexec_pipe().expect("pipe");
        let mut writer = File::from(write);
        writer.write_all(b"one\r\ntwo\rthree\nlast").expect("write");
        drop(writer);

        let mut stdout = ChildStdout::new(read, Buffering::Full(4), Some(DecodeErrors::Strict));
        let lines: Vec<String> = stdout
            .text_lines()
            .collect::<Result<_, _>>()
            .expect("decode");
        let expected = vec!["one\n", "two\n", "three\n", "last"];
        crate::assert_with_log!(lines == expected, "lines", expected, lines);
        crate::test_complete!("text_lines_normalize_every_terminator");
    }

    #[test]
    fn read_text_applies_decode_policy() {
        init_test("read_text_applies_decode_policy");
        for (errors, expect_ok) in [(DecodeErrors::Strict, false), (DecodeErrors::Replace, true)] {
            let (read, write) = sys::cloexec_pipe().expect("pipe");
            File::from(write).write_all(b"ok\xff\r\n").expect("write");
            let mut stderr = ChildStderr::new(read, Buffering::Default, Some(errors));
            let text = stderr.read_text();
            match (&text, expect_ok) {
                (Ok(text), true) => {
                    crate::assert_with_log!(text == "ok\u{fffd}\n", "replaced", "ok\u{fffd}\n", text);
                }
                (Err(ProcessError::Decode(_)), false) => {}
                _ => panic!("unexpected result for {errors:?}: {text:?}"),
            }
        }
        crate::test_complete!("read_text_applies_decode_policy");
    }

    #[test]
    fn unbuffered_stdin_writes_through() {
        init_test("unbuffered_stdin_writes_through");
        let (read, write) = sys::cloexec_pipe().expect("pipe");
        let mut stdin = ChildStdin::new(write, Buffering::Unbuffered);
        stdin.write_all(b"now").expect("write");
        let mut reader = File::from(read);
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).expect("read");
        crate::assert_with_log!(&buf == b"now", "immediate", b"now", buf);
        crate::test_complete!("unbuffered_stdin_writes_through");
    }
}
