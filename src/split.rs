//! Odd-width transfer splitting.
//!
//! The DMA burst engine only accepts rows of a multiple of four pixels for
//! some formats. A request violating this is cut into an aligned head,
//! programmed directly, and a tail narrower than four pixels which is
//! rendered into a four-pixel-wide scratch buffer and copied row by row into
//! the destination.

use heapless::Vec;

use crate::overlay::Area;

/// Row width granularity required by the burst engine, in pixels.
pub const BURST_PIXELS: u32 = 4;

/// Maximum number of source areas in one transfer (blend: foreground and
/// background).
pub const MAX_SOURCES: usize = 2;

/// Where a step writes its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Straight into the destination overlay
    Direct,
    /// Into the scratch buffer, then copied into the destination
    Scratch,
}

/// One hardware transfer of a split request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub dest: Area,
    pub sources: Vec<Area, MAX_SOURCES>,
    pub target: Target,
}

pub type Plan = Vec<Step, 2>;

/// Computes the hardware transfers for `dest` fed by `sources`.
///
/// `aligned` tells whether any format involved needs burst alignment. When the
/// sources have the destination's size they are cut at the same column;
/// otherwise the request is scaled and only a destination narrower than four
/// pixels is redirected through the scratch buffer.
pub fn plan(dest: Area, sources: &[Area], aligned: bool) -> Plan {
    let mut steps = Plan::new();

    let dest_rem = dest.w % BURST_PIXELS;
    let any_rem = dest_rem != 0 || sources.iter().any(|s| s.w % BURST_PIXELS != 0);

    if !aligned || !any_rem {
        push(&mut steps, dest, sources, Target::Direct);
        return steps;
    }

    let head_w = dest.w - dest_rem;
    let same_size = sources.iter().all(|s| s.same_size(&dest));

    if same_size {
        if head_w > 0 {
            let head = Area { w: head_w, ..dest };
            let head_sources = cut(sources, |s| Area {
                w: s.w - s.w % BURST_PIXELS,
                ..*s
            });

            push_owned(&mut steps, head, head_sources, Target::Direct);
        }

        let tail = Area {
            x: dest.x + head_w,
            w: dest_rem,
            ..dest
        };
        let tail_sources = cut(sources, |s| {
            let rem = s.w % BURST_PIXELS;
            Area {
                x: s.x + s.w - rem,
                w: rem,
                ..*s
            }
        });

        push_owned(&mut steps, tail, tail_sources, Target::Scratch);
    } else if head_w == 0 {
        push(&mut steps, dest, sources, Target::Scratch);
    } else {
        push(&mut steps, dest, sources, Target::Direct);
    }

    steps
}

fn cut(sources: &[Area], f: impl Fn(&Area) -> Area) -> Vec<Area, MAX_SOURCES> {
    sources.iter().take(MAX_SOURCES).map(f).collect()
}

fn push(steps: &mut Plan, dest: Area, sources: &[Area], target: Target) {
    push_owned(steps, dest, cut(sources, |s| *s), target);
}

fn push_owned(steps: &mut Plan, dest: Area, sources: Vec<Area, MAX_SOURCES>, target: Target) {
    // A plan never holds more than a head and a tail.
    let _ = steps.push(Step {
        dest,
        sources,
        target,
    });
}
