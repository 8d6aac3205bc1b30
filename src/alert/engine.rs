//! Audible side of the alert. The visual indicator never depends on it.

use std::sync::Arc;

use anyhow::Result;

// Device errors repeat on every alert on a station without speakers.
const ENABLE_LOGS: bool = true;

#[allow(unused_imports)]
use crate::{log_info, log_warn};

/// Something that can play the looping alert sound.
///
/// `start` only reports failures to hand the request over; playback errors
/// surface later on the audio thread and are logged there.
pub trait AlertSound: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

/// Used when sound is disabled in settings or the crate is built without audio.
#[derive(Debug, Default)]
pub struct SilentAlertSound;

impl AlertSound for SilentAlertSound {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}
}

#[cfg(feature = "audio")]
pub use rodio_engine::AudioEngineHandle;

#[cfg(feature = "audio")]
mod rodio_engine {
    use std::sync::{
        mpsc::{self, Sender},
        Arc, Mutex,
    };
    use std::thread;

    use anyhow::{anyhow, Result};
    use rodio::{OutputStream, Sink};

    use super::{AlertSound, ENABLE_LOGS};
    use crate::alert::chime::AlertChime;
    use crate::{log_info, log_warn};

    enum AudioCommand {
        Start,
        Stop,
    }

    /// Handle to the dedicated audio thread that owns the non-`Send` rodio
    /// stream and sink.
    pub struct AudioEngineHandle {
        tx: Arc<Mutex<Option<Sender<AudioCommand>>>>,
        volume: f32,
    }

    impl AudioEngineHandle {
        pub fn new(volume: f32) -> Self {
            Self {
                tx: Arc::new(Mutex::new(None)),
                volume: volume.clamp(0.0, 1.0),
            }
        }

        fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
            let mut guard = self
                .tx
                .lock()
                .map_err(|_| anyhow!("audio engine handle poisoned"))?;
            if let Some(tx) = guard.as_ref() {
                return Ok(tx.clone());
            }

            let (tx, rx) = mpsc::channel::<AudioCommand>();
            let volume = self.volume;

            thread::Builder::new()
                .name("alert-audio".to_string())
                .spawn(move || {
                    let mut _stream: Option<OutputStream> = None;
                    let mut sink: Option<Sink> = None;

                    while let Ok(cmd) = rx.recv() {
                        match cmd {
                            AudioCommand::Start => {
                                if sink.as_ref().is_some_and(|s| !s.empty()) {
                                    continue;
                                }
                                match open_sink() {
                                    Ok((stream, new_sink)) => {
                                        new_sink.set_volume(volume);
                                        new_sink.append(AlertChime::new());
                                        new_sink.play();
                                        _stream = Some(stream);
                                        sink = Some(new_sink);
                                    }
                                    Err(err) => {
                                        log_warn!("alert sound unavailable: {err}");
                                    }
                                }
                            }
                            AudioCommand::Stop => {
                                if let Some(old) = sink.take() {
                                    old.stop();
                                }
                                _stream = None;
                            }
                        }
                    }
                    log_info!("alert audio thread shutting down");
                })
                .map_err(|err| anyhow!("failed to spawn audio thread: {err}"))?;

            *guard = Some(tx.clone());
            Ok(tx)
        }
    }

    fn open_sink() -> Result<(OutputStream, Sink)> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| anyhow!("failed to open audio output: {e}"))?;
        let sink = Sink::try_new(&handle).map_err(|e| anyhow!("failed to create audio sink: {e}"))?;
        Ok((stream, sink))
    }

    impl AlertSound for AudioEngineHandle {
        fn start(&self) -> Result<()> {
            let tx = self.ensure_thread()?;
            tx.send(AudioCommand::Start)
                .map_err(|err| anyhow!("audio thread gone: {err}"))
        }

        fn stop(&self) {
            if let Ok(Some(tx)) = self.tx.lock().map(|g| g.clone()) {
                let _ = tx.send(AudioCommand::Stop);
            }
        }
    }
}

/// Pick the sound backend for the station settings.
pub fn alert_sound(enabled: bool, volume: f32) -> Arc<dyn AlertSound> {
    if !enabled {
        log_info!("alert sound disabled, alerts are visual only");
        return Arc::new(SilentAlertSound);
    }

    #[cfg(feature = "audio")]
    {
        Arc::new(AudioEngineHandle::new(volume))
    }

    #[cfg(not(feature = "audio"))]
    {
        let _ = volume;
        log_warn!("built without audio support, alerts are visual only");
        Arc::new(SilentAlertSound)
    }
}
