//! Framebuffer query and control surface
//!
//! The capability set a framebuffer device node or UI compositor drives the
//! display through. [`Lcdc`] implements it; higher layers hold a
//! `&dyn FramebufferOps` and translate results with [`Error::errno`].
//!
//! [`Error::errno`]: crate::errors::Error::errno

use crate::cache::DataCache;
use crate::errors::Result;
use crate::hal::RegisterBlock;
use crate::lcdc::{BlendRequest, BlitRequest, Lcdc};
use crate::overlay::{Area, ColorMap, CurveMap, DitherMap, Overlay, PlaneInfo, VideoInfo};

pub trait FramebufferOps: Send + Sync {
    fn get_video_info(&self) -> Result<VideoInfo>;

    fn get_plane_info(&self, planeno: u8) -> Result<PlaneInfo>;

    fn get_clut(&self, cmap: &mut ColorMap) -> Result<()>;

    fn put_clut(&self, cmap: &ColorMap) -> Result<()>;

    fn get_curves(&self, curves: &mut CurveMap) -> Result<()>;

    fn put_curves(&self, curves: &CurveMap) -> Result<()>;

    fn get_dither(&self) -> Result<DitherMap>;

    fn put_dither(&self, map: &DitherMap) -> Result<()>;

    fn get_overlay_info(&self, overlay: u8) -> Result<Overlay>;

    fn set_transparency(&self, overlay: u8, alpha: u8, mode: u8) -> Result<()>;

    fn set_chroma_key(&self, overlay: u8, key: u32) -> Result<()>;

    fn set_color(&self, overlay: u8, argb: u32) -> Result<()>;

    fn set_blank(&self, overlay: u8, blank: bool) -> Result<()>;

    fn set_area(&self, overlay: u8, area: &Area) -> Result<()>;

    fn blit(&self, request: &BlitRequest) -> Result<()>;

    fn blend(&self, request: &BlendRequest) -> Result<()>;

    fn pan_display(&self, xoffset: u32, yoffset: u32) -> Result<()>;

    fn wait_for_vsync(&self) -> Result<()>;

    fn update_area(&self, area: &Area) -> Result<()>;
}

impl<R, D, C> FramebufferOps for Lcdc<R, D, C>
where
    R: RegisterBlock,
    D: RegisterBlock,
    C: DataCache + Clone,
{
    fn get_video_info(&self) -> Result<VideoInfo> {
        Lcdc::get_video_info(self)
    }

    fn get_plane_info(&self, planeno: u8) -> Result<PlaneInfo> {
        Lcdc::get_plane_info(self, planeno)
    }

    fn get_clut(&self, cmap: &mut ColorMap) -> Result<()> {
        Lcdc::get_clut(self, cmap)
    }

    fn put_clut(&self, cmap: &ColorMap) -> Result<()> {
        Lcdc::put_clut(self, cmap)
    }

    fn get_curves(&self, curves: &mut CurveMap) -> Result<()> {
        Lcdc::get_curves(self, curves)
    }

    fn put_curves(&self, curves: &CurveMap) -> Result<()> {
        Lcdc::put_curves(self, curves)
    }

    fn get_dither(&self) -> Result<DitherMap> {
        Lcdc::get_dither(self)
    }

    fn put_dither(&self, map: &DitherMap) -> Result<()> {
        Lcdc::put_dither(self, map)
    }

    fn get_overlay_info(&self, overlay: u8) -> Result<Overlay> {
        Lcdc::get_overlay_info(self, overlay)
    }

    fn set_transparency(&self, overlay: u8, alpha: u8, mode: u8) -> Result<()> {
        Lcdc::set_transparency(self, overlay, alpha, mode)
    }

    fn set_chroma_key(&self, overlay: u8, key: u32) -> Result<()> {
        Lcdc::set_chroma_key(self, overlay, key)
    }

    fn set_color(&self, overlay: u8, argb: u32) -> Result<()> {
        Lcdc::set_color(self, overlay, argb)
    }

    fn set_blank(&self, overlay: u8, blank: bool) -> Result<()> {
        Lcdc::set_blank(self, overlay, blank)
    }

    fn set_area(&self, overlay: u8, area: &Area) -> Result<()> {
        Lcdc::set_area(self, overlay, area)
    }

    fn blit(&self, request: &BlitRequest) -> Result<()> {
        Lcdc::blit(self, request)
    }

    fn blend(&self, request: &BlendRequest) -> Result<()> {
        Lcdc::blend(self, request)
    }

    fn pan_display(&self, xoffset: u32, yoffset: u32) -> Result<()> {
        Lcdc::pan_display(self, xoffset, yoffset)
    }

    fn wait_for_vsync(&self) -> Result<()> {
        Lcdc::wait_for_vsync(self)
    }

    fn update_area(&self, area: &Area) -> Result<()> {
        Lcdc::update_area(self, area)
    }
}
