//! Test doubles shared by the unit tests.

use rand::RngCore;

/// Returns the largest possible word for the first `high_words` draws and
/// zero afterwards.
///
/// `gen::<f64>()` maps those to just below 1.0 and exactly 0.0, so a dig
/// survives every roll made while "high" and collapses on the first survival
/// roll made after the switch.
pub(crate) struct ScriptedRng {
    high_words: usize,
}

impl ScriptedRng {
    pub(crate) fn new(high_words: usize) -> Self {
        Self { high_words }
    }
}

impl RngCore for ScriptedRng {
    fn next_u32(&mut self) -> u32 {
        // Truncation keeps the high/low pattern.
        #[allow(clippy::cast_possible_truncation)]
        let word = self.next_u64() as u32;
        word
    }

    fn next_u64(&mut self) -> u64 {
        if self.high_words > 0 {
            self.high_words -= 1;
            u64::MAX
        } else {
            0
        }
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let word = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
