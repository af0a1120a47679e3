// gpu/buffer.rs — wgpu buffers, host mapping and queue copies.
//
// MEMORY KINDS → USAGE FLAGS
// ──────────────────────────
//   StagingIn    MAP_WRITE | COPY_SRC    host writes, copied to the device
//   StagingOut   MAP_READ  | COPY_DST    copied from the device, host reads
//   ReadOnly     STORAGE | COPY_SRC | COPY_DST
//   WriteOnly    STORAGE | COPY_SRC | COPY_DST
//   ReadWrite    STORAGE | COPY_SRC | COPY_DST
//
// Kernel-bound buffers carry both copy directions so that one stage's
// output can feed another stage's input, or be read back through a
// staging buffer, without reallocating.
//
// MAPPING
// ───────
// `map_async` + `device.poll(Wait)` + an mpsc channel, as everywhere else
// in the crate. Host copies block; `touch` only queues the map request and
// leaves completion to `finish_maps`.

use std::sync::mpsc;
use std::sync::Arc;

use crate::error::DeviceError;
use crate::runtime::Memory;

use super::device::{GpuDevice, GpuEvent, PendingMap};

const F32_SIZE: u64 = std::mem::size_of::<f32>() as u64;

/// Shared handle to a wgpu buffer of f32 elements.
#[derive(Clone)]
pub struct GpuBuffer(Arc<GpuBufferInner>);

struct GpuBufferInner {
    buffer: wgpu::Buffer,
    len: usize,
    memory: Memory,
    label: String,
}

impl GpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.0.buffer
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    pub fn memory(&self) -> Memory {
        self.0.memory
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub(crate) fn same(&self, other: &GpuBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn bytes(&self) -> u64 {
        self.0.len as u64 * F32_SIZE
    }

    fn mismatch(&self, reason: impl Into<String>) -> DeviceError {
        DeviceError::BufferMismatch {
            label: self.0.label.clone(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("label", &self.0.label)
            .field("memory", &self.0.memory)
            .field("len", &self.0.len)
            .finish()
    }
}

pub(crate) fn usage_for(memory: Memory) -> wgpu::BufferUsages {
    match memory {
        Memory::StagingIn => wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
        Memory::StagingOut => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        Memory::ReadOnly | Memory::WriteOnly | Memory::ReadWrite => {
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST
        }
    }
}

fn map_mode(buffer: &GpuBuffer) -> Result<wgpu::MapMode, DeviceError> {
    match buffer.memory() {
        Memory::StagingIn => Ok(wgpu::MapMode::Write),
        Memory::StagingOut => Ok(wgpu::MapMode::Read),
        other => Err(buffer.mismatch(format!("{other:?} memory is not host visible"))),
    }
}

impl GpuDevice {
    pub(crate) fn alloc_buffer(&self, label: &str, len: usize, memory: Memory) -> Result<GpuBuffer, DeviceError> {
        let bytes = len as u64 * F32_SIZE;
        let buffer = self.scoped(label, bytes, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: usage_for(memory),
                mapped_at_creation: false,
            })
        })?;
        Ok(GpuBuffer(Arc::new(GpuBufferInner {
            buffer,
            len,
            memory,
            label: label.to_string(),
        })))
    }

    /// Block until the map request on `slice` resolves.
    fn map_blocking(&self, slice: &wgpu::BufferSlice<'_>, mode: wgpu::MapMode) -> Result<(), DeviceError> {
        let (tx, rx) = mpsc::channel();
        slice.map_async(mode, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| DeviceError::MapDropped)??;
        Ok(())
    }

    /// Queue a map request; `finish_maps` completes and unmaps it.
    pub(crate) fn touch_buffer(&self, staging: &GpuBuffer) -> Result<(), DeviceError> {
        let mode = map_mode(staging)?;
        let (tx, rx) = mpsc::channel();
        staging.raw().slice(..).map_async(mode, move |r| {
            let _ = tx.send(r);
        });
        self.pending_maps.lock().push(PendingMap {
            buffer: staging.clone(),
            done: rx,
        });
        Ok(())
    }

    /// Wait for the device, then unmap every touched buffer whose map
    /// succeeded. Reports the first failed map.
    pub(crate) fn finish_maps(&self) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::Wait);
        let pending = std::mem::take(&mut *self.pending_maps.lock());
        let mut first_err = None;
        for map in pending {
            match map.done.try_recv() {
                Ok(Ok(())) => map.buffer.raw().unmap(),
                Ok(Err(e)) => {
                    first_err.get_or_insert(DeviceError::Map(e));
                }
                Err(_) => {
                    first_err.get_or_insert(DeviceError::MapDropped);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn map_write(&self, staging: &GpuBuffer, data: &[f32]) -> Result<(), DeviceError> {
        if staging.memory() != Memory::StagingIn {
            return Err(staging.mismatch(format!("{:?} memory is not host writable", staging.memory())));
        }
        if data.len() > staging.len() {
            return Err(staging.mismatch(format!("{} elements do not fit in {}", data.len(), staging.len())));
        }
        if data.is_empty() {
            return Ok(());
        }
        let slice = staging.raw().slice(..data.len() as u64 * F32_SIZE);
        self.map_blocking(&slice, wgpu::MapMode::Write)?;
        slice
            .get_mapped_range_mut()
            .copy_from_slice(bytemuck::cast_slice(data));
        staging.raw().unmap();
        Ok(())
    }

    /// Copy a staging buffer's contents to the host. Input staging is
    /// mapped for writing, which exposes its current contents on native
    /// backends.
    pub(crate) fn map_read(&self, staging: &GpuBuffer) -> Result<Vec<f32>, DeviceError> {
        let mode = map_mode(staging)?;
        let slice = staging.raw().slice(..);
        self.map_blocking(&slice, mode)?;
        let out = {
            let mapped = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        staging.raw().unmap();
        Ok(out)
    }

    /// Submit a copy of the first `len` elements. Copying a buffer onto
    /// itself submits an empty command buffer so the caller still gets a
    /// token.
    pub(crate) fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, len: usize) -> Result<GpuEvent, DeviceError> {
        let bytes = len as u64 * F32_SIZE;
        for buf in [src, dst] {
            if buf.bytes() < bytes {
                return Err(buf.mismatch(format!("copy of {len} elements exceeds {}", buf.len())));
            }
        }
        let index = self.scoped(dst.label(), bytes, || {
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("copy"),
            });
            if !src.same(dst) {
                encoder.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, bytes);
            }
            self.queue.submit(std::iter::once(encoder.finish()))
        })?;
        tracing::trace!(src = src.label(), dst = dst.label(), bytes, "copy submitted");
        Ok(GpuEvent { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_usage_is_mappable_one_way() {
        let input = usage_for(Memory::StagingIn);
        assert!(input.contains(wgpu::BufferUsages::MAP_WRITE));
        assert!(!input.contains(wgpu::BufferUsages::MAP_READ));
        let output = usage_for(Memory::StagingOut);
        assert!(output.contains(wgpu::BufferUsages::MAP_READ));
        assert!(!output.contains(wgpu::BufferUsages::STORAGE));
    }

    #[test]
    fn test_device_memory_supports_chaining() {
        for memory in [Memory::ReadOnly, Memory::WriteOnly, Memory::ReadWrite] {
            let usage = usage_for(memory);
            assert!(usage.contains(wgpu::BufferUsages::STORAGE));
            assert!(usage.contains(wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST));
        }
    }
}
