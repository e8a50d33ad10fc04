//! Audible and visible feedback on the reader.

use keycreator_core::Result;
use keycreator_hardware::Twn4Reader;
use std::time::Duration;
use tracing::trace;

/// LED bits of the reader.
pub mod led {
    pub const RED: u8 = 0x01;
    pub const GREEN: u8 = 0x02;
    pub const YELLOW: u8 = 0x04;
    pub const ALL: u8 = RED | GREEN | YELLOW;
}

/// One beep followed by a pause before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tone {
    pub volume: u8,
    pub frequency: u16,
    pub on_ms: u16,
    pub off_ms: u16,
    pub gap_ms: u64,
}

impl Tone {
    const fn new(volume: u8, frequency: u16, on_ms: u16, off_ms: u16, gap_ms: u64) -> Self {
        Self {
            volume,
            frequency,
            on_ms,
            off_ms,
            gap_ms,
        }
    }
}

/// Three ascending tones.
pub const OK_MELODY: [Tone; 3] = [
    Tone::new(60, 1500, 100, 50, 120),
    Tone::new(60, 2000, 100, 50, 120),
    Tone::new(60, 2500, 100, 50, 0),
];

/// Three descending tones.
pub const ERROR_MELODY: [Tone; 3] = [
    Tone::new(80, 2000, 120, 60, 140),
    Tone::new(80, 1200, 120, 60, 140),
    Tone::new(80, 800, 180, 80, 0),
];

/// Beeps and LEDs. A muted instance still drives the LEDs.
#[derive(Debug, Clone)]
pub struct Feedback {
    reader: Twn4Reader,
    muted: bool,
}

impl Feedback {
    pub fn new(reader: Twn4Reader) -> Self {
        Self {
            reader,
            muted: false,
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    async fn play(&self, melody: &[Tone]) -> Result<()> {
        if self.muted {
            trace!("Feedback muted");
            return Ok(());
        }
        for tone in melody {
            self.reader
                .beep(tone.volume, tone.frequency, tone.on_ms, tone.off_ms)
                .await?;
            if tone.gap_ms > 0 {
                tokio::time::sleep(Duration::from_millis(tone.gap_ms)).await;
            }
        }
        Ok(())
    }

    pub async fn beep_ok(&self) -> Result<()> {
        self.play(&OK_MELODY).await
    }

    pub async fn beep_error(&self) -> Result<()> {
        self.play(&ERROR_MELODY).await
    }

    pub async fn init_leds(&self) -> Result<()> {
        self.reader.led_init(led::ALL).await
    }

    pub async fn led_on(&self, leds: u8) -> Result<()> {
        self.reader.led_on(leds).await
    }

    pub async fn led_off(&self, leds: u8) -> Result<()> {
        self.reader.led_off(leds).await
    }

    pub async fn led_blink(&self, leds: u8, on_ms: u16, off_ms: u16) -> Result<()> {
        self.reader.led_blink(leds, on_ms, off_ms).await
    }
}
