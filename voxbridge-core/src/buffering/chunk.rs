//! Typed block of mono audio: reference clips, decoded files, chunk payloads.

/// A contiguous block of mono PCM samples at a known sample rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (e.g. 16000, 22050, 48000).
    pub sample_rate: u32,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Returns the duration of this chunk in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Returns true if the chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Drop everything past `max_secs`. Returns true if samples were removed.
    pub fn truncate_secs(&mut self, max_secs: f32) -> bool {
        let max_len = (self.sample_rate as f64 * max_secs.max(0.0) as f64) as usize;
        if self.samples.len() > max_len {
            self.samples.truncate(max_len);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_limits_duration() {
        let mut chunk = AudioChunk::new(vec![0.0; 30 * 100], 100);
        assert!(chunk.truncate_secs(25.0));
        assert_eq!(chunk.samples.len(), 2_500);
        assert!((chunk.duration_secs() - 25.0).abs() < 1e-9);
        assert!(!chunk.truncate_secs(25.0));
    }
}
