//! Line format for trace records.
//!
//! Field order is fixed per category so that downstream tools can rely on it:
//!
//! ```text
//! category=CALLBACK  correlationId  domain  cbid  site  timestamp  [apiName  cpp_stack  python_stack]
//! category=ACTIVITY_MEMORY  correlationId  type  kind  timestamp  address  size  deviceId  contextId  streamId
//! ```
//!
//! Values never contain a tab or a newline. Multi-line values (stacks) are
//! flattened with [`NEWLINE_TOKEN`].

use crate::types::records::{CallbackRecord, Category, MemoryActivityRecord};
use std::fmt;
use thiserror::Error;

/// Replaces newlines inside a single field
pub const NEWLINE_TOKEN: &str = "[NL]";

/// Separator between fields
pub const FIELD_SEPARATOR: char = '\t';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineError {
    #[error("line does not start with a category field")]
    MissingCategory,

    #[error("unknown category: {0}")]
    UnknownCategory(String),

    #[error("malformed field (expected key=value): {0}")]
    MalformedField(String),
}

/// Display adapter that writes a value with tabs and newlines neutralized.
pub struct Flat<'a>(pub &'a str);

impl fmt::Display for Flat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rest = self.0;
        while let Some(pos) = rest.find(&['\n', '\r', '\t'][..]) {
            f.write_str(&rest[..pos])?;
            match rest.as_bytes()[pos] {
                b'\n' => f.write_str(NEWLINE_TOKEN)?,
                b'\t' => f.write_str(" ")?,
                // \r\n collapses into the token emitted for \n
                _ => {}
            }
            rest = &rest[pos + 1..];
        }
        f.write_str(rest)
    }
}

/// Flatten a multi-line string into a single log field value.
pub fn flatten(s: &str) -> String {
    Flat(s).to_string()
}

impl fmt::Display for CallbackRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category={}\tcorrelationId={}\tdomain={}\tcbid={}\tsite={}\ttimestamp={}",
            Category::Callback,
            self.correlation_id,
            self.domain.raw(),
            self.cbid,
            self.site.as_str(),
            self.timestamp
        )?;
        if let Some(name) = &self.api_name {
            write!(f, "\tapiName={}", Flat(name))?;
        }
        if let Some(stack) = &self.native_stack {
            write!(f, "\tcpp_stack={}", Flat(stack))?;
        }
        if let Some(stack) = &self.python_stack {
            write!(f, "\tpython_stack={}", Flat(stack))?;
        }
        Ok(())
    }
}

impl fmt::Display for MemoryActivityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category={}\tcorrelationId={}\ttype={}\tkind={}\ttimestamp={}\taddress={}\tsize={}\tdeviceId={}\tcontextId={}\tstreamId={}",
            Category::ActivityMemory,
            self.correlation_id,
            self.operation.as_str(),
            self.kind.as_str(),
            self.timestamp,
            self.address,
            self.size,
            self.device_id,
            self.context_id,
            self.stream_id
        )
    }
}

/// A parsed log line: its category plus the remaining fields in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub category: Category,
    pub fields: Vec<(String, String)>,
}

impl LogLine {
    /// Parse one line. A trailing newline is ignored; values may contain `=`.
    pub fn parse(line: &str) -> Result<Self, LineError> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        let mut chunks = line.split(FIELD_SEPARATOR);

        let category = chunks
            .next()
            .and_then(|c| c.strip_prefix("category="))
            .ok_or(LineError::MissingCategory)?
            .parse::<Category>()?;

        let fields = chunks
            .map(|chunk| {
                chunk
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| LineError::MalformedField(chunk.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { category, fields })
    }

    /// Value of the first field named `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Field names in line order
    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _)| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::records::*;

    fn thin_callback() -> CallbackRecord {
        CallbackRecord {
            correlation_id: 42,
            domain: CallbackDomain::RuntimeApi,
            cbid: 20,
            site: CallbackSite::Exit,
            timestamp: 1000,
            api_name: None,
            native_stack: None,
            python_stack: None,
        }
    }

    #[test]
    fn test_thin_callback_line() {
        let line = thin_callback().to_string();
        assert_eq!(
            line,
            "category=CALLBACK\tcorrelationId=42\tdomain=2\tcbid=20\tsite=EXIT\ttimestamp=1000"
        );
    }

    #[test]
    fn test_tracked_callback_line_keeps_stacks_on_one_line() {
        let record = CallbackRecord {
            site: CallbackSite::Enter,
            api_name: Some("cudaMalloc".to_string()),
            native_stack: Some("#0 a\n#1 b".to_string()),
            python_stack: Some("File \"x.py\"\tline 1\r\n".to_string()),
            ..thin_callback()
        };
        let line = record.to_string();
        assert!(!line.contains('\n'));
        assert!(line.ends_with("\tcpp_stack=#0 a[NL]#1 b\tpython_stack=File \"x.py\" line 1[NL]"));

        let parsed = LogLine::parse(&line).unwrap();
        assert_eq!(
            parsed.keys(),
            vec![
                "correlationId",
                "domain",
                "cbid",
                "site",
                "timestamp",
                "apiName",
                "cpp_stack",
                "python_stack"
            ]
        );
        assert_eq!(parsed.get("apiName"), Some("cudaMalloc"));
    }

    #[test]
    fn test_memory_line() {
        let record = MemoryActivityRecord {
            correlation_id: 7,
            operation: MemoryOperation::Free,
            kind: MemoryKind::DeviceStatic,
            timestamp: 55,
            address: 0x7f00_0000,
            size: 4096,
            device_id: 1,
            context_id: 2,
            stream_id: 3,
        };
        let parsed = LogLine::parse(&record.to_string()).unwrap();
        assert_eq!(parsed.category, Category::ActivityMemory);
        assert_eq!(parsed.get("type"), Some("FREE"));
        assert_eq!(parsed.get("kind"), Some("DEVICE_STATIC"));
        assert_eq!(parsed.get("address"), Some("2130706432"));
        assert_eq!(parsed.get("streamId"), Some("3"));
    }

    #[test]
    fn test_parse_value_with_equals() {
        let parsed = LogLine::parse("category=CALLBACK\tpython_stack=a=b\n").unwrap();
        assert_eq!(parsed.get("python_stack"), Some("a=b"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            LogLine::parse("correlationId=1"),
            Err(LineError::MissingCategory)
        );
        assert_eq!(
            LogLine::parse("category=KERNEL"),
            Err(LineError::UnknownCategory("KERNEL".to_string()))
        );
        assert_eq!(
            LogLine::parse("category=CALLBACK\tbroken"),
            Err(LineError::MalformedField("broken".to_string()))
        );
    }

    #[test]
    fn test_flatten() {
        assert_eq!(flatten("a\nb\r\nc\td"), "a[NL]b[NL]c d");
        assert_eq!(flatten("plain"), "plain");
    }
}
