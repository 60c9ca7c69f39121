//! Binary framing of a task
//!
//! ```text
//! u8     type_length
//! bytes  type_utf8[type_length]
//! u16    headers_length (big endian)
//! bytes  headers[headers_length]
//! bytes  body[..]
//! ```

use std::collections::BTreeMap;

use crate::encoding::Codec;
use crate::error::WireFormatError;
use crate::queue::task::Task;

const MAX_TYPE_LENGTH: usize = u8::MAX as usize;
const MAX_HEADERS_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageFormat {
    headers: Codec,
}

impl MessageFormat {
    pub fn new(headers: Codec) -> Self {
        Self { headers }
    }

    pub fn serialize(&self, task: &Task) -> Result<Vec<u8>, WireFormatError> {
        let task_type = task.task_type.as_bytes();
        if task_type.len() > MAX_TYPE_LENGTH {
            return Err(WireFormatError::TypeTooLong(task_type.len()));
        }

        let headers = self.headers.encode(&task.headers)?;
        if headers.len() > MAX_HEADERS_LENGTH {
            return Err(WireFormatError::HeadersTooLong(headers.len()));
        }

        let mut out = Vec::with_capacity(1 + task_type.len() + 2 + headers.len() + task.body.len());
        out.push(task_type.len() as u8);
        out.extend_from_slice(task_type);
        out.extend_from_slice(&(headers.len() as u16).to_be_bytes());
        out.extend_from_slice(&headers);
        out.extend_from_slice(&task.body);
        Ok(out)
    }

    pub fn deserialize(&self, data: &[u8]) -> Result<Task, WireFormatError> {
        let (&type_len, rest) = data
            .split_first()
            .ok_or(WireFormatError::Truncated("type length"))?;
        let type_len = type_len as usize;
        if rest.len() < type_len {
            return Err(WireFormatError::Truncated("type"));
        }
        let (task_type, rest) = rest.split_at(type_len);
        let task_type = String::from_utf8(task_type.to_vec())?;

        if rest.len() < 2 {
            return Err(WireFormatError::Truncated("headers length"));
        }
        let (len_bytes, rest) = rest.split_at(2);
        let headers_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if rest.len() < headers_len {
            return Err(WireFormatError::Truncated("headers"));
        }
        let (headers, body) = rest.split_at(headers_len);

        let headers: BTreeMap<String, String> = if headers.is_empty() {
            BTreeMap::new()
        } else {
            self.headers.decode(headers)?
        };

        Ok(Task {
            task_type,
            headers,
            body: body.to_vec(),
        })
    }
}
