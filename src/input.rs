//! Upload decoding. The content type is classified once, here, into a closed
//! set of kinds; handlers never look at the raw content-type string.

use crate::error::ApiError;
use crate::pipelines::{PipelineInput, Task};
use serde_json::Value;
use std::io::Cursor;

/// All audio is resampled to this rate before it reaches a pipeline.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// What an uploaded file is, per its declared content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Audio,
    Video,
    Other,
}

impl FileKind {
    pub fn classify(content_type: Option<&str>) -> FileKind {
        match content_type {
            Some(ct) if ct.starts_with("image/") => FileKind::Image,
            Some(ct) if ct.starts_with("audio/") => FileKind::Audio,
            Some(ct) if ct.starts_with("video/") => FileKind::Video,
            _ => FileKind::Other,
        }
    }
}

/// Decode an uploaded file into a pipeline input.
pub fn decode_upload(content_type: Option<&str>, data: &[u8]) -> Result<PipelineInput, ApiError> {
    match FileKind::classify(content_type) {
        FileKind::Image => {
            let image = image::load_from_memory(data)
                .map_err(|e| ApiError::BadRequest(format!("Failed to decode image: {e}")))?;
            Ok(PipelineInput::Image(image.to_rgb8()))
        }
        FileKind::Audio => {
            let samples = decode_wav(data)?;
            Ok(PipelineInput::Audio {
                samples,
                sampling_rate: TARGET_SAMPLE_RATE,
            })
        }
        FileKind::Video => Err(ApiError::BadRequest(
            "Video processing not supported".to_string(),
        )),
        FileKind::Other => Ok(PipelineInput::Bytes(data.to_vec())),
    }
}

/// Decode WAV bytes to mono f32 samples at [`TARGET_SAMPLE_RATE`].
fn decode_wav(data: &[u8]) -> Result<Vec<f32>, ApiError> {
    let mut reader = hound::WavReader::new(Cursor::new(data)).map_err(|e| {
        ApiError::BadRequest(format!(
            "Failed to decode audio: {e} (only WAV uploads are supported)"
        ))
    })?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().filter_map(|s| s.ok()).collect(),
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let max_value = (1i64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .filter_map(|s| s.ok())
                .map(|s| s as f32 / max_value)
                .collect()
        }
    };
    Ok(prepare_samples(
        samples,
        spec.sample_rate,
        spec.channels as usize,
    ))
}

/// Downmix to mono and linearly resample to the target rate.
fn prepare_samples(samples: Vec<f32>, source_rate: u32, channels: usize) -> Vec<f32> {
    let mono: Vec<f32> = if channels > 1 {
        samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        samples
    };

    if source_rate == TARGET_SAMPLE_RATE {
        return mono;
    }
    let ratio = TARGET_SAMPLE_RATE as f32 / source_rate as f32;
    let target_len = (mono.len() as f32 * ratio) as usize;
    (0..target_len)
        .map(|i| {
            let source_index = (i as f32 / ratio) as usize;
            mono.get(source_index).copied().unwrap_or(0.0)
        })
        .collect()
}

/// Lift a decoded `inputs` field into a pipeline input: JSON strings become
/// text, everything else passes through as structured JSON.
pub fn value_to_input(value: Value) -> PipelineInput {
    match value {
        Value::String(s) => PipelineInput::Text(s),
        other => PipelineInput::Json(other),
    }
}

/// The batching workaround: certain task pipelines take a list of strings,
/// so a plain string input is wrapped in a single-element batch.
pub fn shape_for_task(input: PipelineInput, task: Task) -> PipelineInput {
    match input {
        PipelineInput::Text(s) if task.wraps_plain_string() => {
            PipelineInput::TextBatch(vec![s])
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wav_bytes(spec: hound::WavSpec, frames: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in frames {
                writer.write_sample(*sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn classify_by_content_type_prefix() {
        assert_eq!(FileKind::classify(Some("image/png")), FileKind::Image);
        assert_eq!(FileKind::classify(Some("audio/wav")), FileKind::Audio);
        assert_eq!(FileKind::classify(Some("video/mp4")), FileKind::Video);
        assert_eq!(FileKind::classify(Some("application/pdf")), FileKind::Other);
        assert_eq!(FileKind::classify(None), FileKind::Other);
    }

    #[test]
    fn video_is_always_rejected() {
        let err = decode_upload(Some("video/mp4"), b"anything").unwrap_err();
        assert_eq!(err.to_string(), "Video processing not supported");
    }

    #[test]
    fn unknown_content_passes_raw_bytes_through() {
        let input = decode_upload(Some("application/octet-stream"), &[1, 2, 3]).unwrap();
        match input {
            PipelineInput::Bytes(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("expected bytes, got {}", other.kind()),
        }
    }

    #[test]
    fn image_decodes_to_rgb() {
        let mut png = Cursor::new(Vec::new());
        image::RgbImage::new(2, 3)
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();
        let input = decode_upload(Some("image/png"), png.get_ref()).unwrap();
        match input {
            PipelineInput::Image(image) => assert_eq!(image.dimensions(), (2, 3)),
            other => panic!("expected image, got {}", other.kind()),
        }
    }

    #[test]
    fn undecodable_image_is_a_client_error() {
        let err = decode_upload(Some("image/png"), b"not a png").unwrap_err();
        assert!(err.to_string().starts_with("Failed to decode image"));
    }

    #[test]
    fn wav_is_resampled_to_target_rate() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[0i16; 800]);
        match decode_upload(Some("audio/wav"), &bytes).unwrap() {
            PipelineInput::Audio {
                samples,
                sampling_rate,
            } => {
                assert_eq!(sampling_rate, TARGET_SAMPLE_RATE);
                // 100 ms at 8 kHz becomes 100 ms at 16 kHz.
                assert_eq!(samples.len(), 1_600);
            }
            other => panic!("expected audio, got {}", other.kind()),
        }
    }

    #[test]
    fn stereo_wav_is_downmixed() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: TARGET_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        // Left channel at full scale, right silent: mono is the average.
        let frames: Vec<i16> = (0..200).map(|i| if i % 2 == 0 { i16::MAX } else { 0 }).collect();
        let bytes = wav_bytes(spec, &frames);
        match decode_upload(Some("audio/x-wav"), &bytes).unwrap() {
            PipelineInput::Audio { samples, .. } => {
                assert_eq!(samples.len(), 100);
                assert!((samples[0] - 0.5).abs() < 0.01);
            }
            other => panic!("expected audio, got {}", other.kind()),
        }
    }

    #[test]
    fn non_wav_audio_is_a_client_error() {
        let err = decode_upload(Some("audio/mpeg"), b"ID3\x04").unwrap_err();
        assert!(err.to_string().contains("only WAV uploads are supported"));
    }

    #[test]
    fn plain_string_wrapped_for_listed_tasks() {
        let shaped = shape_for_task(
            value_to_input(json!("hello")),
            Task::TextClassification,
        );
        match shaped {
            PipelineInput::TextBatch(batch) => assert_eq!(batch, vec!["hello".to_string()]),
            other => panic!("expected batch, got {}", other.kind()),
        }
    }

    #[test]
    fn plain_string_untouched_for_other_tasks() {
        let shaped = shape_for_task(value_to_input(json!("hello")), Task::FeatureExtraction);
        assert!(matches!(shaped, PipelineInput::Text(_)));
    }

    #[test]
    fn structured_json_is_not_wrapped() {
        let shaped = shape_for_task(
            value_to_input(json!({"question": "?", "context": "c"})),
            Task::TextClassification,
        );
        assert!(matches!(shaped, PipelineInput::Json(_)));
    }
}
