use crate::{
    config::{ModelConfig, Validatable},
    model_service::{ModelService, Prediction, PredictionError},
};
use async_trait::async_trait;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::{TensorRef, ValueType},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const DEFAULT_INPUT_SIZE: u32 = 224;
const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputLayout {
    /// `[batch, height, width, channels]`, the Keras default.
    Nhwc,
    /// `[batch, channels, height, width]`
    Nchw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputSpec {
    pub layout: InputLayout,
    pub width: u32,
    pub height: u32,
}

impl InputSpec {
    /// Dynamic dimensions are reported as non-positive values.
    pub fn from_shape(shape: &[i64]) -> Self {
        let (layout, height, width) = match shape {
            [_, h, w, c] if *c == CHANNELS as i64 => (InputLayout::Nhwc, *h, *w),
            [_, c, h, w] if *c == CHANNELS as i64 => (InputLayout::Nchw, *h, *w),
            [_, h, w, _] => (InputLayout::Nhwc, *h, *w),
            _ => (InputLayout::Nhwc, -1, -1),
        };

        if height > 0 && width > 0 {
            Self {
                layout,
                width: width as u32,
                height: height as u32,
            }
        } else {
            Self {
                layout,
                width: DEFAULT_INPUT_SIZE,
                height: DEFAULT_INPUT_SIZE,
            }
        }
    }
}

fn transform_image(image_data: &[u8], spec: &InputSpec) -> Result<Array4<f32>, String> {
    let image_reader = image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let original_img = image_reader
        .decode()
        .map_err(|e| format!("Error decoding image: {}", e))?;

    let img = original_img
        .resize_exact(spec.width, spec.height, FilterType::CatmullRom)
        .to_rgb8();

    let (height, width) = (spec.height as usize, spec.width as usize);
    let mut input = match spec.layout {
        InputLayout::Nhwc => Array4::zeros((1, height, width, CHANNELS)),
        InputLayout::Nchw => Array4::zeros((1, CHANNELS, height, width)),
    };

    for (x, y, pixel) in img.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..CHANNELS {
            let value = (pixel[c] as f32) / 255.;
            match spec.layout {
                InputLayout::Nhwc => input[[0, y, x, c]] = value,
                InputLayout::Nchw => input[[0, c, y, x]] = value,
            }
        }
    }

    Ok(input)
}

/// First maximum wins on ties.
fn argmax(probabilities: &[f32]) -> Option<(usize, f32)> {
    probabilities
        .iter()
        .copied()
        .enumerate()
        .reduce(|best, item| if item.1 > best.1 { item } else { best })
}

fn to_confidence_percentage(probability: f32) -> f32 {
    let percentage = (probability * 100.).clamp(1., 100.);
    (percentage * 100.).round() / 100.
}

fn postprocess(probabilities: &[f32], labels: &[String]) -> Result<Prediction, PredictionError> {
    let (class_index, probability) = argmax(probabilities)
        .ok_or_else(|| PredictionError::InvalidOutput("empty probability vector".into()))?;

    let label = labels.get(class_index).ok_or_else(|| {
        PredictionError::InvalidOutput(format!(
            "class index {} outside of {} known labels",
            class_index,
            labels.len()
        ))
    })?;

    Ok(Prediction {
        label: label.clone(),
        class_index,
        confidence: to_confidence_percentage(probability),
    })
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_spec: InputSpec,
    labels: Arc<Vec<String>>,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig, labels: Vec<String>) -> Result<Self, ort::Error> {
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(session)
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let input_shape: Vec<i64> = match sessions[0].inputs.first().map(|i| &i.input_type) {
            Some(ValueType::Tensor { shape, .. }) => shape.iter().copied().collect(),
            _ => Vec::new(),
        };
        let input_spec = InputSpec::from_shape(&input_shape);

        tracing::info!(
            "Created {} ONNX sessions from {:?}, input shape {:?} read as {:?}",
            num_instances,
            model_config.get_path(),
            input_shape,
            input_spec
        );

        Ok(Self {
            sessions: Arc::new(
                sessions
                    .into_iter()
                    .map(|session| Arc::new(Mutex::new(session)))
                    .collect(),
            ),
            counter: Arc::new(AtomicUsize::new(0)),
            input_spec,
            labels: Arc::new(labels),
        })
    }

    fn run_inference(&self, input: &Array4<f32>) -> Result<Vec<f32>, PredictionError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| PredictionError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| PredictionError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| PredictionError::Inference(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            PredictionError::InvalidOutput(format!("failed to extract tensor: {}", e))
        })?;

        // Batch of one: the class probabilities are the first row.
        let num_classes = shape.last().copied().unwrap_or(0).max(0) as usize;
        let row = data.get(..num_classes).ok_or_else(|| {
            PredictionError::InvalidOutput(format!("output shape {:?} does not match data", shape))
        })?;

        Ok(row.to_vec())
    }

    fn classify(&self, image_data: &[u8]) -> Result<Prediction, PredictionError> {
        let input =
            transform_image(image_data, &self.input_spec).map_err(PredictionError::InvalidImage)?;
        let probabilities = self.run_inference(&input)?;
        tracing::debug!("Class probabilities: {:?}", probabilities);

        postprocess(&probabilities, &self.labels)
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(&self, image_data: Vec<u8>) -> Result<Prediction, PredictionError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.classify(&image_data))
            .await
            .map_err(|e| PredictionError::Inference(format!("inference task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn encode_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb(color));
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, image::ImageFormat::Png).unwrap();
        cursor.into_inner()
    }

    fn labels() -> Vec<String> {
        vec!["CLL".into(), "FL".into(), "MCL".into()]
    }

    #[test]
    fn test_input_spec_from_shape() {
        assert_eq!(
            InputSpec::from_shape(&[-1, 150, 200, 3]),
            InputSpec {
                layout: InputLayout::Nhwc,
                width: 200,
                height: 150
            }
        );
        assert_eq!(
            InputSpec::from_shape(&[1, 3, 256, 256]),
            InputSpec {
                layout: InputLayout::Nchw,
                width: 256,
                height: 256
            }
        );
        assert_eq!(
            InputSpec::from_shape(&[-1, -1, -1, 3]),
            InputSpec {
                layout: InputLayout::Nhwc,
                width: 224,
                height: 224
            }
        );
        assert_eq!(
            InputSpec::from_shape(&[1, 256, 256, 1]),
            InputSpec {
                layout: InputLayout::Nhwc,
                width: 256,
                height: 256
            }
        );
        assert_eq!(InputSpec::from_shape(&[]).width, 224);
    }

    #[test]
    fn test_transform_image_nhwc() {
        let image_data = encode_png(100, 60, [255, 0, 51]);
        let spec = InputSpec::from_shape(&[1, 224, 224, 3]);

        let input = transform_image(&image_data, &spec).unwrap();

        assert_eq!(input.shape(), &[1, 224, 224, 3]);
        assert!((input[[0, 10, 10, 0]] - 1.0).abs() < 0.01);
        assert!(input[[0, 10, 10, 1]].abs() < 0.01);
        assert!((input[[0, 10, 10, 2]] - 0.2).abs() < 0.01);
    }

    #[test]
    fn test_transform_image_nchw() {
        let image_data = encode_png(32, 32, [0, 255, 0]);
        let spec = InputSpec::from_shape(&[1, 3, 64, 48]);

        let input = transform_image(&image_data, &spec).unwrap();

        assert_eq!(input.shape(), &[1, 3, 64, 48]);
        assert!((input[[0, 1, 63, 47]] - 1.0).abs() < 0.01);
        assert!(input.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_transform_image_rejects_garbage() {
        let spec = InputSpec::from_shape(&[]);
        assert!(transform_image(&[0u8; 100], &spec).is_err());
    }

    #[test]
    fn test_argmax_first_max_wins() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), Some((1, 0.4)));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_confidence_percentage() {
        assert!((to_confidence_percentage(0.87654) - 87.65).abs() < 1e-3);
        assert_eq!(to_confidence_percentage(0.001), 1.0);
        assert_eq!(to_confidence_percentage(1.2), 100.0);
    }

    #[test]
    fn test_postprocess() {
        let prediction = postprocess(&[0.1, 0.05, 0.85], &labels()).unwrap();
        assert_eq!(prediction.label, "MCL");
        assert_eq!(prediction.class_index, 2);
        assert!((prediction.confidence - 85.0).abs() < 1e-3);

        let err = postprocess(&[0.1, 0.1, 0.1, 0.7], &labels()).unwrap_err();
        assert!(matches!(err, PredictionError::InvalidOutput(_)));

        let err = postprocess(&[], &labels()).unwrap_err();
        assert!(matches!(err, PredictionError::InvalidOutput(_)));
    }
}
