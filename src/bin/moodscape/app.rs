//! Live playback: the audio device renders the shared graph, the terminal
//! thread runs the orchestrator and the TUI.

use color_eyre::eyre::{eyre, Result as EyreResult, WrapErr};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::RingBuffer;
use tracing::{error, info};

use moodscape::{
    render::{GraphRenderer, SharedRenderer},
    session::shared_factory,
    EngineConfig, MoodTable, Orchestrator, MAX_BLOCK_SIZE,
};

use super::ui::UiApp;

/// Samples of output kept in flight for the waveform view.
const WAVE_RING: usize = 8192;

pub fn run(config: EngineConfig, moods: MoodTable, mood: Option<String>) -> EyreResult<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| eyre!("no default output device available"))?;
    let supported = device
        .default_output_config()
        .wrap_err("failed to fetch default output config")?;

    let sample_rate = supported.sample_rate().0 as f32;
    let channels = supported.channels() as usize;
    info!(sample_rate, channels, "audio device opened");

    let shared = SharedRenderer::new(GraphRenderer::new(sample_rate));
    let (mut wave_tx, wave_rx) = RingBuffer::<f32>::new(WAVE_RING);

    let audio = shared.clone();
    let lost = shared.clone();
    let mut render_buf = vec![0.0f32; MAX_BLOCK_SIZE];
    let stream = device.build_output_stream(
        &supported.into(),
        move |data: &mut [f32], _| {
            let total_frames = data.len() / channels;
            let mut frames_written = 0;
            while frames_written < total_frames {
                let frames = (total_frames - frames_written).min(MAX_BLOCK_SIZE);
                let block = &mut render_buf[..frames];
                audio.render(block);

                // mono to every channel
                let offset = frames_written * channels;
                for (i, &sample) in block.iter().enumerate() {
                    data[offset + i * channels..offset + (i + 1) * channels].fill(sample);
                    // a full ring just drops samples for the view
                    let _ = wave_tx.push(sample);
                }
                frames_written += frames;
            }
        },
        move |err| {
            error!(%err, "audio stream error");
            lost.close();
        },
        None,
    )?;
    stream.play()?;

    let mut orchestrator = Orchestrator::new(config, moods, shared_factory(&shared, sample_rate));
    if !orchestrator.set_playing(true, mood.as_deref()) {
        return Err(eyre!("could not start mood {:?}", mood));
    }

    let mut app = UiApp::new(orchestrator, wave_rx, sample_rate);
    let mut terminal = ratatui::init();
    let result = app.run(&mut terminal);
    ratatui::restore();

    app.shutdown();
    drop(stream);
    result
}
