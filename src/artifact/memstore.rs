//! In-memory payload sink for small payloads such as MCU firmware

use std::collections::BTreeMap;
use std::io::Read;

use super::{ArtifactHeader, DataFile, PayloadHeader, PayloadSink};
use crate::Result;

/// Collects every data file into memory, keyed by file name
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Payload type of the last initialized payload
    pub payload_type: String,

    /// Extracted files
    pub files: BTreeMap<String, Vec<u8>>,
}

impl PayloadSink for MemoryStore {
    fn initialize(&mut self, _artifact: &ArtifactHeader, payload: &PayloadHeader) -> Result<()> {
        self.payload_type.clone_from(&payload.payload_type);
        Ok(())
    }

    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    fn store(&mut self, reader: &mut dyn Read, file: &DataFile) -> Result<()> {
        let mut buf = Vec::with_capacity(usize::try_from(file.size).unwrap_or_default());
        reader.read_to_end(&mut buf)?;
        self.files.insert(file.name.clone(), buf);
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}
