//! Reverb - room simulation via delay networks.
//!
//! Classic Schroeder topology: four damped combs in parallel build the tail,
//! two allpasses in series diffuse it.
//!
//! ```text
//! Input ──┬──→ [Comb 1] ──┐
//!         ├──→ [Comb 2] ──┤
//!         ├──→ [Comb 3] ──┼──→ (+) ──→ [Allpass 1] ──→ [Allpass 2] ──→ wet
//!         └──→ [Comb 4] ──┘
//! ```
//!
//! The master chain uses one shared instance as the "room" every module
//! plays into; moods reshape it through `room`, `damping` and `mix`.

/// 50 ms at 192 kHz.
const MAX_COMB_DELAY: usize = 9600;
/// 10 ms at 192 kHz.
const MAX_ALLPASS_DELAY: usize = 1920;

const COMB_DELAYS_MS: [f32; 4] = [29.7, 37.1, 41.1, 43.7];
const ALLPASS_DELAYS_MS: [f32; 2] = [5.0, 1.7];

struct CombFilter {
    buffer: Box<[f32]>,
    delay_samples: usize,
    write_pos: usize,
    feedback: f32,
    damp: f32,
    filter_state: f32,
}

impl CombFilter {
    fn new(delay_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; MAX_COMB_DELAY].into_boxed_slice(),
            delay_samples: delay_samples.clamp(1, MAX_COMB_DELAY),
            write_pos: 0,
            feedback: 0.5,
            damp: 0.5,
            filter_state: 0.0,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let output = self.buffer[self.write_pos];
        // one-pole lowpass in the loop absorbs highs on every pass
        self.filter_state = output * (1.0 - self.damp) + self.filter_state * self.damp;
        self.buffer[self.write_pos] = input + self.filter_state * self.feedback;
        self.write_pos = (self.write_pos + 1) % self.delay_samples;
        output
    }
}

struct AllpassFilter {
    buffer: Box<[f32]>,
    delay_samples: usize,
    write_pos: usize,
    gain: f32,
}

impl AllpassFilter {
    fn new(delay_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; MAX_ALLPASS_DELAY].into_boxed_slice(),
            delay_samples: delay_samples.clamp(1, MAX_ALLPASS_DELAY),
            write_pos: 0,
            gain: 0.5,
        }
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let delayed = self.buffer[self.write_pos];
        let output = -self.gain * input + delayed;
        self.buffer[self.write_pos] = input + self.gain * output;
        self.write_pos = (self.write_pos + 1) % self.delay_samples;
        output
    }
}

pub struct SchroederReverb {
    combs: [CombFilter; 4],
    allpasses: [AllpassFilter; 2],
    room: f32,
    damping: f32,
}

impl SchroederReverb {
    pub fn new(sample_rate: f32) -> Self {
        let samples = |ms: f32| (ms * sample_rate / 1000.0) as usize;
        let mut reverb = Self {
            combs: COMB_DELAYS_MS.map(|ms| CombFilter::new(samples(ms))),
            allpasses: ALLPASS_DELAYS_MS.map(|ms| AllpassFilter::new(samples(ms))),
            room: -1.0,
            damping: -1.0,
        };
        reverb.set_room(0.5);
        reverb.set_damping(0.5);
        reverb
    }

    /// Room size in 0..=1, mapped to comb feedback 0.70..=0.98.
    pub fn set_room(&mut self, room: f32) {
        let room = room.clamp(0.0, 1.0);
        if room == self.room {
            return;
        }
        self.room = room;
        let feedback = 0.7 + room * 0.28;
        for comb in &mut self.combs {
            comb.feedback = feedback;
        }
    }

    /// High frequency absorption in 0..=1.
    pub fn set_damping(&mut self, damping: f32) {
        let damping = damping.clamp(0.0, 1.0);
        if damping == self.damping {
            return;
        }
        self.damping = damping;
        for comb in &mut self.combs {
            comb.damp = damping;
        }
    }

    /// Wet signal only; the caller blends it with the dry path.
    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let mut wet = 0.0;
        for comb in &mut self.combs {
            wet += comb.process(input);
        }
        wet *= 0.25;
        for allpass in &mut self.allpasses {
            wet = allpass.process(wet);
        }
        wet
    }
}
