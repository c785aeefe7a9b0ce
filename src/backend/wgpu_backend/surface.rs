//! Presentation through a configured `wgpu::Surface`.

use std::sync::Arc;

use crate::backend::{PresentStatus, PresentSurface};
use crate::error::{SyncError, SyncResult};

use super::WgpuBackend;

/// A configured surface and the texture acquired from it.
pub struct WgpuSurface {
    backend: Arc<WgpuBackend>,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    current: Option<wgpu::SurfaceTexture>,
    acquired: u32,
}

impl std::fmt::Debug for WgpuSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuSurface")
            .field("format", &self.config.format)
            .field("width", &self.config.width)
            .field("height", &self.config.height)
            .field("present_mode", &self.config.present_mode)
            .finish()
    }
}

fn present_mode(sync_interval: u32) -> wgpu::PresentMode {
    if sync_interval > 0 {
        wgpu::PresentMode::AutoVsync
    } else {
        wgpu::PresentMode::AutoNoVsync
    }
}

impl WgpuSurface {
    /// Configure `surface` for the backend's device.
    pub fn new(
        backend: Arc<WgpuBackend>,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
        sync_interval: u32,
    ) -> SyncResult<Self> {
        let adapter = backend.adapter().ok_or_else(|| {
            SyncError::InvalidConfig("Surface requires a backend that owns its adapter".into())
        })?;
        let caps = surface.get_capabilities(adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| caps.formats.first().copied())
            .ok_or_else(|| SyncError::Native("Surface is not supported by the adapter".into()))?;
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: width.max(1),
            height: height.max(1),
            present_mode: present_mode(sync_interval),
            alpha_mode,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(backend.device(), &config);

        Ok(Self {
            backend,
            surface,
            config,
            current: None,
            acquired: 0,
        })
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.config.format
    }

    /// Texture acquired by the last successful acquire, until presented.
    pub fn current_texture(&self) -> Option<&wgpu::SurfaceTexture> {
        self.current.as_ref()
    }
}

impl PresentSurface for WgpuSurface {
    fn back_buffer_count(&self) -> u32 {
        self.config.desired_maximum_frame_latency + 1
    }

    fn acquire_next(&mut self) -> SyncResult<Option<u32>> {
        match self.surface.get_current_texture() {
            Ok(texture) => {
                let index = self.acquired % self.back_buffer_count();
                self.acquired = self.acquired.wrapping_add(1);
                self.current = Some(texture);
                Ok(Some(index))
            }
            Err(wgpu::SurfaceError::Outdated) => Ok(None),
            Err(wgpu::SurfaceError::Lost) => Err(SyncError::SurfaceLost),
            Err(e) => Err(SyncError::Native(format!(
                "Failed to acquire surface texture: {}",
                e
            ))),
        }
    }

    /// Present the acquired texture. A changed `sync_interval` reconfigures
    /// the surface on the next resize.
    fn present(&mut self, sync_interval: u32) -> SyncResult<PresentStatus> {
        self.config.present_mode = present_mode(sync_interval);
        let texture = self.current.take().ok_or_else(|| {
            SyncError::Native("present called without an acquired texture".into())
        })?;
        let suboptimal = texture.suboptimal;
        texture.present();
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Presented
        })
    }

    fn resize(&mut self, width: u32, height: u32) -> SyncResult<()> {
        self.current = None;
        self.config.width = width.max(1);
        self.config.height = height.max(1);
        self.surface.configure(self.backend.device(), &self.config);
        log::debug!("Surface reconfigured to {}x{}", self.config.width, self.config.height);
        Ok(())
    }
}
