use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use tracing_subscriber::fmt::MakeWriter;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r"(?i)(sk-[A-Za-z0-9_-]{16,}|Bearer\s+[^\s,;]+|data:image/[a-z]+;base64,[A-Za-z0-9+/=]{64,})"
    ).expect("Invalid redaction regex");
}

pub fn redact_text(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

pub struct RedactingWriter<W> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact_text(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps a [`MakeWriter`] so every writer it hands out redacts secrets.
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_masks_bearer_and_keys() {
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter::new(&mut out);
            writer
                .write_all(b"auth=Bearer abc.def key=sk-0123456789abcdefXYZ ok\n")
                .expect("write to vec");
        }
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "auth=[REDACTED] key=[REDACTED] ok\n");
    }

    #[test]
    fn test_short_data_urls_are_kept() {
        assert_eq!(redact_text("data:image/png;base64,AAAA"), "data:image/png;base64,AAAA");
    }
}
