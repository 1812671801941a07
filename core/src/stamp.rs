//! Per-track stamp reviser.
//!
//! Maps producer DTS/PTS — which may wrap, reset, or originate from more
//! than one ingest source over a stream's life — onto a monotonic output
//! base starting at 0, similar in spirit to how an RTP client maps wrapping
//! 32-bit timestamps onto a non-wrapping internal clock. The difference:
//! that kind of client typically *rejects* backward or excessive forward
//! jumps as a hostile-server defense, while a stamp reviser instead
//! *absorbs* a regression by rebasing so the output never goes backward —
//! the contract here is "produce a monotonically non-decreasing dts_out",
//! not "detect anomalies and fail".

/// Guard against producer wraparound/discontinuity: a `dts_in` delta larger
/// than this (in either direction) from the current reference is treated as
/// a fresh start rather than real elapsed time. Ten seconds gives plenty of
/// headroom above normal jitter and GOP spacing while still catching a
/// genuine clock reset promptly, expressed in milliseconds since this
/// reviser operates on millisecond stamps rather than a codec clock rate.
const MAX_STAMP_JUMP_MS: i64 = 10_000;

/// Per-track DTS/PTS rebaser. State is `(ref_in, ref_out, last_out)`.
#[derive(Debug, Clone)]
pub struct StampReviser {
    ref_in: Option<i64>,
    ref_out: i64,
    last_out: Option<i64>,
}

impl Default for StampReviser {
    fn default() -> Self {
        StampReviser {
            ref_in: None,
            ref_out: 0,
            last_out: None,
        }
    }
}

impl StampReviser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revises one `(dts_in, pts_in)` pair (milliseconds) into
    /// `(dts_out, pts_out)`. `dts_out` is strictly increasing after the
    /// first sample; `pts_out - dts_out == max(0, pts_in - dts_in)`.
    pub fn revise(&mut self, dts_in: u32, pts_in: u32) -> (u32, u32) {
        let dts_in = i64::from(dts_in);
        let pts_in = i64::from(pts_in);

        let ref_in = match self.ref_in {
            None => {
                self.ref_in = Some(dts_in);
                dts_in
            }
            Some(r) => r,
        };

        let mut delta = dts_in - ref_in;
        if delta.abs() > MAX_STAMP_JUMP_MS {
            // Producer wrap or reset: rebase so this sample continues from
            // wherever the output clock currently stands.
            self.ref_in = Some(dts_in);
            self.ref_out = self.last_out.map(|l| l + 1).unwrap_or(0);
            delta = 0;
        }

        let mut dts_out = self.ref_out + delta;
        if let Some(last) = self.last_out {
            if dts_out <= last {
                // Non-monotonic producer: insert a tiny epsilon instead of
                // repeating or reversing the output timestamp.
                dts_out = last + 1;
            }
        }

        let composition_offset = (pts_in - dts_in).max(0);
        let pts_out = dts_out + composition_offset;

        self.last_out = Some(dts_out);
        (clamp_u32(dts_out), clamp_u32(pts_out))
    }

    /// Returns the most recently produced output DTS, if any.
    pub fn last_output(&self) -> Option<u32> {
        self.last_out.map(clamp_u32)
    }

    /// Ties this reviser's output clock to `reference`'s `(ref_in, ref_out)`
    /// offsets, so an audio track can derive its output base from the
    /// video clock once the video reviser has produced its first sample.
    pub fn sync_to(&mut self, reference: &StampReviser) {
        if let Some(ref_in) = reference.ref_in {
            self.ref_in = Some(ref_in);
            self.ref_out = reference.ref_out;
        }
    }
}

fn clamp_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_rebases_to_zero() {
        let mut r = StampReviser::new();
        let (dts, pts) = r.revise(1_000, 1_000);
        assert_eq!(dts, 0);
        assert_eq!(pts, 0);
    }

    #[test]
    fn monotonic_under_normal_progress() {
        let mut r = StampReviser::new();
        let (d0, _) = r.revise(1_000, 1_000);
        let (d1, _) = r.revise(1_040, 1_040);
        let (d2, _) = r.revise(1_080, 1_080);
        assert!(d0 <= d1);
        assert!(d1 <= d2);
        assert_eq!(d1 - d0, 40);
    }

    #[test]
    fn composition_offset_preserved_and_clamped_nonnegative() {
        let mut r = StampReviser::new();
        let (dts, pts) = r.revise(1_000, 1_050);
        assert_eq!(pts - dts, 50);

        let mut r2 = StampReviser::new();
        // pts < dts: clamp the negative composition offset to 0.
        let (dts2, pts2) = r2.revise(1_000, 900);
        assert_eq!(dts2, pts2);
    }

    #[test]
    fn backward_jump_is_absorbed_not_propagated() {
        let mut r = StampReviser::new();
        let (d0, _) = r.revise(5_000, 5_000);
        let (d1, _) = r.revise(5_040, 5_040);
        // Producer resets its clock back to 0.
        let (d2, _) = r.revise(0, 0);
        assert!(d2 >= d1);
        assert!(d0 <= d1);
    }

    #[test]
    fn sync_to_rebases_onto_the_reference_clock() {
        let mut video = StampReviser::new();
        let mut audio = StampReviser::new();
        video.revise(0, 0);
        // Audio ingest started on its own independent clock, offset by 5s.
        audio.revise(5_000, 5_000);

        audio.sync_to(&video);

        // Audio dts_in is now expressed on video's clock: a sample 6s after
        // video's start produces the same dts_out video would for 6s in.
        let (audio_dts, _) = audio.revise(6_000, 6_000);
        let (video_dts, _) = video.revise(6_000, 6_000);
        assert_eq!(audio_dts, video_dts);
    }
}
