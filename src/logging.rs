use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

/// Name of the span the lifecycle opens around each public operation
pub const BACKEND_SPAN: &str = "backend";

/// A tracing event formatter for console output.
///
/// The whole line is coloured by level. Events emitted inside a backend span
/// are prefixed with the backend's tag, e.g. `[dstm] Running, telemetry on
/// port 4000`, so that interleaved output from several backends stays
/// readable. No timestamps or level names are printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the line so colour applies to all of it
        let mut buffer = String::new();

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                if span.name() != BACKEND_SPAN {
                    continue;
                }
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        let tag = fields
                            .as_str()
                            .strip_prefix("backend=")
                            .unwrap_or(fields.as_str());
                        buffer.push('[');
                        buffer.push_str(tag);
                        buffer.push_str("] ");
                    }
                }
            }
        }

        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Map `-v` occurrences to a default filter directive
///
/// Only used when `RUST_LOG` is unset.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_backend_tag_prefix() {
        colored::control::set_override(false);
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .event_format(ColorizedFormatter)
            .with_writer(capture.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("backend", backend = %"dstm");
            let _enter = span.enter();
            tracing::info!("Running, telemetry on port {}", 4000);
        });
        tracing::subscriber::with_default(
            tracing_subscriber::fmt()
                .event_format(ColorizedFormatter)
                .with_writer(capture.clone())
                .finish(),
            || tracing::warn!("no backend here"),
        );

        let output = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines, vec!["[dstm] Running, telemetry on port 4000", "no backend here"]);
    }

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(1), "debug");
        assert_eq!(default_directive(5), "trace");
    }
}
