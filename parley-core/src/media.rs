//! Media framing and flow control: quality presets, send-loop pacing, placeholder frames,
//! and the bounded receive queue. Capture hardware and codecs live outside the core.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::MessageType;

/// Audio packets per second, independent of quality.
pub const AUDIO_FRAME_RATE: u32 = 50;
/// Receive queue depth before the oldest frame is dropped.
pub const AUDIO_QUEUE_DEPTH: usize = 10;
pub const VIDEO_QUEUE_DEPTH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn stream_type(self) -> MessageType {
        match self {
            MediaKind::Audio => MessageType::AudioStream,
            MediaKind::Video => MessageType::VideoStream,
        }
    }

    pub fn from_stream_type(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::AudioStream => Some(MediaKind::Audio),
            MessageType::VideoStream => Some(MediaKind::Video),
            _ => None,
        }
    }

    pub fn queue_depth(self) -> usize {
        match self {
            MediaKind::Audio => AUDIO_QUEUE_DEPTH,
            MediaKind::Video => VIDEO_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    Low,
    Medium,
    High,
}

impl AudioQuality {
    pub fn sample_rate(self) -> u32 {
        match self {
            AudioQuality::Low => 22_050,
            AudioQuality::Medium => 44_100,
            AudioQuality::High => 48_000,
        }
    }

    pub fn bit_depth(self) -> u16 {
        match self {
            AudioQuality::Low => 8,
            AudioQuality::Medium | AudioQuality::High => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

impl VideoQuality {
    pub fn resolution(self) -> (u32, u32) {
        match self {
            VideoQuality::Low => (320, 240),
            VideoQuality::Medium => (640, 480),
            VideoQuality::High => (1280, 720),
        }
    }

    pub fn frame_rate(self) -> u32 {
        match self {
            VideoQuality::Low => 15,
            VideoQuality::Medium => 25,
            VideoQuality::High => 30,
        }
    }
}

/// Capture settings for one pipeline. Applied to captures after the change, never retroactively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaQuality {
    Audio(AudioQuality),
    Video(VideoQuality),
}

impl MediaQuality {
    pub fn kind(self) -> MediaKind {
        match self {
            MediaQuality::Audio(_) => MediaKind::Audio,
            MediaQuality::Video(_) => MediaKind::Video,
        }
    }

    pub fn frame_rate(self) -> u32 {
        match self {
            MediaQuality::Audio(_) => AUDIO_FRAME_RATE,
            MediaQuality::Video(v) => v.frame_rate(),
        }
    }

    /// Synthetic frame used while capture hardware is unavailable.
    pub fn placeholder_frame(self) -> Vec<u8> {
        match self {
            MediaQuality::Audio(a) => {
                let samples = (a.sample_rate() / AUDIO_FRAME_RATE) as usize;
                let bytes_per_sample = (a.bit_depth() / 8) as usize;
                vec![0u8; samples * bytes_per_sample]
            }
            MediaQuality::Video(v) => placeholder_video(v.resolution()),
        }
    }
}

/// Dark gradient at one eighth of the capture resolution, packed RGB.
fn placeholder_video((width, height): (u32, u32)) -> Vec<u8> {
    let w = (width / 8).max(1);
    let h = (height / 8).max(1);
    let mut out = Vec::with_capacity((w * h * 3) as usize);
    for y in 0..h {
        for x in 0..w {
            // (20,20,40) top-left to (40,20,60) bottom-right
            let t = (x + y) * 20 / (w + h);
            out.push((20 + t) as u8);
            out.push(20);
            out.push((40 + t) as u8);
        }
    }
    out
}

/// Fixed-interval pacing for a send loop: sleep only what is left of the frame interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    interval: Duration,
}

impl Pacer {
    /// Pacer for `frames_per_sec` (clamped to at least 1).
    pub fn new(frames_per_sec: u32) -> Self {
        let fps = frames_per_sec.max(1);
        Self {
            interval: Duration::from_secs(1) / fps,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleep needed after a frame that took `elapsed` to produce. Never negative.
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.interval.saturating_sub(elapsed)
    }
}

/// Bounded FIFO of received frames; when full, the oldest frame is dropped.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
    dropped: u64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Push a frame. Returns true if an older frame was dropped to make room.
    pub fn push(&mut self, frame: Vec<u8>) -> bool {
        let overflow = self.frames.len() >= self.capacity;
        if overflow {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
        overflow
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_sleeps_remainder() {
        let p = Pacer::new(50);
        assert_eq!(p.interval(), Duration::from_millis(20));
        assert_eq!(p.remaining(Duration::from_millis(5)), Duration::from_millis(15));
        assert_eq!(p.remaining(Duration::ZERO), Duration::from_millis(20));
    }

    #[test]
    fn pacer_never_negative() {
        let p = Pacer::new(25);
        assert_eq!(p.remaining(Duration::from_millis(40)), Duration::ZERO);
        assert_eq!(p.remaining(Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn pacer_zero_rate_clamped() {
        assert_eq!(Pacer::new(0).interval(), Duration::from_secs(1));
    }

    /// Simulated loop: average inter-frame time converges to 1/N when work fits in the interval,
    /// and equals the work time when it does not.
    #[test]
    fn simulated_average_interval() {
        let p = Pacer::new(30);
        let mut clock = Duration::ZERO;
        let frames = 300u32;
        for i in 0..frames {
            let work = Duration::from_millis(u64::from(i % 20));
            clock += work;
            clock += p.remaining(work);
        }
        let avg = clock / frames;
        let target = p.interval();
        let diff = if avg > target { avg - target } else { target - avg };
        assert!(diff < Duration::from_micros(100), "avg {avg:?} target {target:?}");

        let mut slow_clock = Duration::ZERO;
        for _ in 0..10 {
            let work = Duration::from_millis(50);
            slow_clock += work + p.remaining(work);
        }
        assert_eq!(slow_clock, Duration::from_millis(500));
    }

    #[test]
    fn presets() {
        assert_eq!(AudioQuality::High.sample_rate(), 48_000);
        assert_eq!(AudioQuality::Low.bit_depth(), 8);
        assert_eq!(VideoQuality::High.resolution(), (1280, 720));
        assert_eq!(MediaQuality::Video(VideoQuality::Medium).frame_rate(), 25);
        assert_eq!(MediaQuality::Audio(AudioQuality::Low).frame_rate(), AUDIO_FRAME_RATE);
    }

    #[test]
    fn placeholder_sizes() {
        // 48000 / 50 samples * 2 bytes
        assert_eq!(
            MediaQuality::Audio(AudioQuality::High).placeholder_frame().len(),
            1920
        );
        assert!(MediaQuality::Audio(AudioQuality::High)
            .placeholder_frame()
            .iter()
            .all(|&b| b == 0));
        // 80 x 60 x 3
        assert_eq!(
            MediaQuality::Video(VideoQuality::Medium).placeholder_frame().len(),
            14_400
        );
    }

    #[test]
    fn frame_queue_drops_oldest() {
        let mut q = FrameQueue::new(2);
        assert!(!q.push(vec![1]));
        assert!(!q.push(vec![2]));
        assert!(q.push(vec![3]));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop(), Some(vec![2]));
        assert_eq!(q.pop(), Some(vec![3]));
        assert!(q.pop().is_none());
    }

    #[test]
    fn stream_type_mapping() {
        assert_eq!(MediaKind::Audio.stream_type(), MessageType::AudioStream);
        assert_eq!(
            MediaKind::from_stream_type(MessageType::VideoStream),
            Some(MediaKind::Video)
        );
        assert_eq!(MediaKind::from_stream_type(MessageType::TextMessage), None);
    }
}
