use std::sync::mpsc;

use capture_protocol::{CaptureView, ImageExtent, Pixel, PixelBuffer};

use crate::{ReadbackError, ReadbackSink, ReadbackSource};

/// The two render targets a capture reads back: the lit color pass and the
/// stencil-id segmentation pass.
#[derive(Debug)]
pub struct WgpuReadbackTargets {
    pub color: wgpu::Texture,
    pub segmentation: wgpu::Texture,
}

struct PendingReadback {
    sink: ReadbackSink,
    buffer: wgpu::Buffer,
    padded_bytes_per_row: u32,
    segmentation_offset: u64,
    receiver: mpsc::Receiver<Result<(), wgpu::BufferAsyncError>>,
}

pub struct WgpuReadbackSource {
    device: wgpu::Device,
    queue: wgpu::Queue,
    targets: WgpuReadbackTargets,
    extent: ImageExtent,
    view: CaptureView,
    pending: Vec<PendingReadback>,
}

fn is_bgra(format: wgpu::TextureFormat) -> bool {
    matches!(
        format,
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb
    )
}

fn is_rgba8_family(format: wgpu::TextureFormat) -> bool {
    is_bgra(format)
        || matches!(
            format,
            wgpu::TextureFormat::Rgba8Unorm
                | wgpu::TextureFormat::Rgba8UnormSrgb
                | wgpu::TextureFormat::Rgba8Uint
        )
}

fn padded_bytes_per_row(width: u32) -> u32 {
    // wgpu requires bytes_per_row to be a multiple of 256 for texture copies to buffers.
    let unpadded_bytes_per_row = width
        .checked_mul(4)
        .expect("rgba8 readback bytes_per_row overflow");
    unpadded_bytes_per_row
        .checked_add(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT - 1)
        .expect("readback bytes_per_row pad overflow")
        / wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
        * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

impl WgpuReadbackSource {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        targets: WgpuReadbackTargets,
    ) -> Result<Self, ReadbackError> {
        let color_size = targets.color.size();
        let segmentation_size = targets.segmentation.size();
        if color_size.width != segmentation_size.width
            || color_size.height != segmentation_size.height
        {
            return Err(ReadbackError::ExtentMismatch {
                request: ImageExtent::new(color_size.width, color_size.height),
                source_extent: ImageExtent::new(
                    segmentation_size.width,
                    segmentation_size.height,
                ),
            });
        }
        for texture in [&targets.color, &targets.segmentation] {
            if !is_rgba8_family(texture.format()) {
                return Err(ReadbackError::Device(format!(
                    "unsupported readback texture format {:?}",
                    texture.format()
                )));
            }
            if !texture.usage().contains(wgpu::TextureUsages::COPY_SRC) {
                return Err(ReadbackError::Device(
                    "readback texture is missing COPY_SRC usage".to_owned(),
                ));
            }
        }
        let extent = ImageExtent::new(color_size.width, color_size.height);
        if extent.is_empty() {
            return Err(ReadbackError::EmptyExtent(extent));
        }
        Ok(Self {
            device,
            queue,
            targets,
            extent,
            view: CaptureView::default(),
            pending: Vec::new(),
        })
    }

    pub fn set_view(&mut self, view: CaptureView) {
        self.view = view;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn copy_target(
        encoder: &mut wgpu::CommandEncoder,
        texture: &wgpu::Texture,
        buffer: &wgpu::Buffer,
        offset: u64,
        padded_bytes_per_row: u32,
        extent: ImageExtent,
    ) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(extent.height),
                },
            },
            wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl ReadbackSource for WgpuReadbackSource {
    fn extent(&self) -> ImageExtent {
        self.extent
    }

    fn capture_view(&self) -> CaptureView {
        self.view
    }

    fn submit_readback(&mut self, sink: ReadbackSink) -> Result<(), ReadbackError> {
        let extent = self.extent;
        let padded_bytes_per_row = padded_bytes_per_row(extent.width);
        let segmentation_offset = u64::from(padded_bytes_per_row)
            .checked_mul(u64::from(extent.height))
            .expect("readback buffer size overflow");
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback.capture_buffer"),
            size: segmentation_offset
                .checked_mul(2)
                .expect("readback buffer size overflow"),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback.capture_encoder"),
            });
        Self::copy_target(
            &mut encoder,
            &self.targets.color,
            &buffer,
            0,
            padded_bytes_per_row,
            extent,
        );
        Self::copy_target(
            &mut encoder,
            &self.targets.segmentation,
            &buffer,
            segmentation_offset,
            padded_bytes_per_row,
            extent,
        );
        self.queue.submit(Some(encoder.finish()));

        let (sender, receiver) = mpsc::channel();
        buffer
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                // The receiver is gone only if the source was dropped mid-copy.
                let _ = sender.send(result);
            });
        self.pending.push(PendingReadback {
            sink,
            buffer,
            padded_bytes_per_row,
            segmentation_offset,
            receiver,
        });
        Ok(())
    }

    fn poll_device(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        if let Err(error) = self.device.poll(wgpu::PollType::Poll) {
            tracing::warn!(%error, "device poll failed during readback");
        }
        let color_bgra = is_bgra(self.targets.color.format());
        let segmentation_bgra = is_bgra(self.targets.segmentation.format());

        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut pending in self.pending.drain(..) {
            match pending.receiver.try_recv() {
                Ok(Ok(())) => {
                    {
                        let mapped = pending.buffer.slice(..).get_mapped_range();
                        let (raw, segmentation) = pending.sink.buffers_mut();
                        copy_rows(&mapped, 0, pending.padded_bytes_per_row, raw, color_bgra);
                        copy_rows(
                            &mapped,
                            pending.segmentation_offset as usize,
                            pending.padded_bytes_per_row,
                            segmentation,
                            segmentation_bgra,
                        );
                    }
                    pending.buffer.unmap();
                    pending.sink.complete();
                }
                Ok(Err(error)) => {
                    tracing::warn!(
                        request = %pending.sink.request_id(),
                        %error,
                        "readback buffer mapping failed"
                    );
                }
                Err(mpsc::TryRecvError::Empty) => still_pending.push(pending),
                Err(mpsc::TryRecvError::Disconnected) => {
                    tracing::warn!(
                        request = %pending.sink.request_id(),
                        "readback map callback dropped"
                    );
                }
            }
        }
        self.pending = still_pending;
    }
}

fn copy_rows(
    mapped: &[u8],
    base_offset: usize,
    padded_bytes_per_row: u32,
    destination: &mut PixelBuffer,
    swap_red_blue: bool,
) {
    let extent = destination.extent();
    let width = extent.width as usize;
    let row_bytes = width * 4;
    for (y, row) in destination.pixels_mut().chunks_exact_mut(width).enumerate() {
        let start = base_offset + y * padded_bytes_per_row as usize;
        let source: &[Pixel] = bytemuck::cast_slice(&mapped[start..start + row_bytes]);
        row.copy_from_slice(source);
        if swap_red_blue {
            for pixel in row.iter_mut() {
                std::mem::swap(&mut pixel.r, &mut pixel.b);
            }
        }
    }
}
