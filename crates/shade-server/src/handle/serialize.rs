//! Binary serialization of handles for checkpoint images and migration.
//!
//! Field order is fixed: the common basic header first, then the
//! type-specific extra section written through the resource vtable. All
//! integers are little-endian.

use std::sync::Arc;

use shade_core::{ShadeError, ShadeResult};
use shade_protocol::resource::ResourceTypeId;

use super::vtable;
use super::{Handle, HandleStatus};
use crate::checkpoint::CheckpointBag;

pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed string.
    pub fn str(&mut self, v: &str) {
        self.u64(v.len() as u64);
        self.buf.extend_from_slice(v.as_bytes());
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, off: 0 }
    }

    fn take(&mut self, n: usize) -> ShadeResult<&'a [u8]> {
        if self.off + n > self.data.len() {
            return Err(ShadeError::InvalidInput(format!(
                "truncated handle image: need {n} bytes at offset {}",
                self.off
            )));
        }
        let slice = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    pub fn u32(&mut self) -> ShadeResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> ShadeResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> ShadeResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn bool(&mut self) -> ShadeResult<bool> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn bytes(&mut self, n: usize) -> ShadeResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn str(&mut self) -> ShadeResult<String> {
        let len = self.u64()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| ShadeError::InvalidInput("non-utf8 string in handle image".into()))
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.off
    }
}

/// Decoded form of one serialized handle.
pub struct HandleImage {
    pub handle: Arc<Handle>,
    /// DAG vertex ids of the parents, rebound after all handles of an image
    /// are instantiated.
    pub parent_vertex_ids: Vec<u64>,
    pub ckpt_version: u64,
}

/// Serialize one handle: basic header, checkpoint state, then the
/// type-specific extra section.
pub fn serialize_handle(handle: &Handle) -> Vec<u8> {
    let mut w = ByteWriter::new();

    w.u32(handle.resource_type.to_tag());
    w.u64(handle.client_addr());
    w.u64(handle.server_addr());

    {
        let parents = handle.parents.read();
        w.u64(parents.len() as u64);
        for parent in parents.iter() {
            w.u64(parent.dag_vertex_id());
        }
    }

    w.u64(handle.dag_vertex_id());
    w.u64(handle.size);
    w.u64(handle.state_size);

    // checkpoint state: the latest device checkpoint wins; with none
    // recorded, fall back to the latest host-injected value
    let (ckpt_version, ckpt_data): (u64, Vec<u8>) = {
        let bag = handle.ckpt_bag.lock();
        match bag.as_ref().and_then(|b| b.get_latest()) {
            Some((version, slot)) => (version, slot.data.clone()),
            None => match handle.latest_host_value() {
                Some((version, data)) => (version, data),
                None => (0, Vec::new()),
            },
        }
    };
    w.u64(ckpt_version);
    w.u64(ckpt_data.len() as u64);
    w.bytes(&ckpt_data);

    (vtable::ops(handle.resource_type).serialize_extra)(handle, &mut w);

    w.into_vec()
}

/// Inverse of `serialize_handle`. The returned handle is `CreatePending`
/// with its latest checkpoint loaded; parents still need rebinding by
/// vertex id.
pub fn deserialize_handle(data: &[u8]) -> ShadeResult<HandleImage> {
    let mut r = ByteReader::new(data);

    let tag = r.u32()?;
    let resource_type = ResourceTypeId::from_tag(tag)
        .ok_or_else(|| ShadeError::InvalidInput(format!("unknown resource tag {tag}")))?;
    let client_addr = r.u64()?;
    let server_addr = r.u64()?;

    let nb_parents = r.u64()?;
    let mut parent_vertex_ids = Vec::with_capacity(nb_parents as usize);
    for _ in 0..nb_parents {
        parent_vertex_ids.push(r.u64()?);
    }

    let dag_vertex_id = r.u64()?;
    let size = r.u64()?;
    let state_size = r.u64()?;
    let ckpt_version = r.u64()?;
    let ckpt_size = r.u64()?;
    let ckpt_data = r.bytes(ckpt_size as usize)?;

    let handle = Handle::new(resource_type, client_addr, size, state_size);
    handle.set_server_addr(server_addr);
    handle.set_dag_vertex_id(dag_vertex_id);
    handle.set_status(HandleStatus::CreatePending);

    if ckpt_size > 0 {
        let mut bag = CheckpointBag::new();
        bag.insert(ckpt_version, ckpt_data, 0);
        *handle.ckpt_bag.lock() = Some(bag);
    }

    (vtable::ops(resource_type).deserialize_extra)(&handle, &mut r)?;

    Ok(HandleImage { handle, parent_vertex_ids, ckpt_version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{FunctionMeta, HandleExtra};

    #[test]
    fn basic_round_trip_preserves_header_and_state() {
        let parent = Handle::new(ResourceTypeId::Context, 0x20, 16, 0);
        parent.set_dag_vertex_id(11);

        let h = Handle::new(ResourceTypeId::Memory, 0x5555_0000_0000, 4096, 4096);
        h.set_server_addr(0x5555_0000_0000);
        h.set_dag_vertex_id(12);
        h.record_parent(parent);
        {
            let mut bag = CheckpointBag::new();
            bag.insert(42, vec![9u8; 4096], 1);
            *h.ckpt_bag.lock() = Some(bag);
        }

        let image = serialize_handle(&h);
        let decoded = deserialize_handle(&image).unwrap();

        assert_eq!(decoded.handle.resource_type, ResourceTypeId::Memory);
        assert_eq!(decoded.handle.client_addr(), 0x5555_0000_0000);
        assert_eq!(decoded.handle.server_addr(), 0x5555_0000_0000);
        assert_eq!(decoded.handle.size, 4096);
        assert_eq!(decoded.handle.state_size, 4096);
        assert_eq!(decoded.handle.dag_vertex_id(), 12);
        assert_eq!(decoded.parent_vertex_ids, vec![11]);

        let bag = decoded.handle.ckpt_bag.lock();
        let (version, slot) = bag.as_ref().unwrap().get_latest().unwrap();
        assert_eq!(version, 42);
        assert_eq!(slot.data, vec![9u8; 4096]);
    }

    #[test]
    fn host_value_backs_state_when_no_checkpoint() {
        let h = Handle::new(ResourceTypeId::Memory, 0x8000, 16, 16);
        h.record_host_value(5, &[1u8; 16]);

        let decoded = deserialize_handle(&serialize_handle(&h)).unwrap();
        let bag = decoded.handle.ckpt_bag.lock();
        let (version, slot) = bag.as_ref().unwrap().get_latest().unwrap();
        assert_eq!(version, 5);
        assert_eq!(slot.data, vec![1u8; 16]);
    }

    #[test]
    fn function_extra_round_trip() {
        let h = Handle::new(ResourceTypeId::Function, 0x100, 16, 0);
        *h.extra.write() = HandleExtra::Function(FunctionMeta {
            name: "kern".to_string(),
            nb_params: 2,
            param_offsets: vec![0, 4],
            param_sizes: vec![4, 4],
            input_pointer_params: vec![0],
            inout_pointer_params: vec![],
            output_pointer_params: vec![1],
            suspicious_params: vec![1],
            has_verified_params: true,
            confirmed_suspicious_params: vec![(1, 8)],
            cbank_param_size: 16,
        });

        let decoded = deserialize_handle(&serialize_handle(&h)).unwrap();
        match &*decoded.handle.extra.read() {
            HandleExtra::Function(meta) => {
                assert_eq!(meta.name, "kern");
                assert_eq!(meta.nb_params, 2);
                assert_eq!(meta.param_offsets, vec![0, 4]);
                assert_eq!(meta.param_sizes, vec![4, 4]);
                assert_eq!(meta.input_pointer_params, vec![0]);
                assert_eq!(meta.output_pointer_params, vec![1]);
                assert_eq!(meta.suspicious_params, vec![1]);
                assert!(meta.has_verified_params);
                assert_eq!(meta.confirmed_suspicious_params, vec![(1, 8)]);
                assert_eq!(meta.cbank_param_size, 16);
            }
            other => panic!("wrong extra: {other:?}"),
        };
    }

    #[test]
    fn truncated_image_is_rejected() {
        let h = Handle::new(ResourceTypeId::Stream, 0x40, 16, 0);
        let image = serialize_handle(&h);
        assert!(deserialize_handle(&image[..image.len() - 4]).is_err());
        assert!(deserialize_handle(&[0xFF; 3]).is_err());
    }
}
