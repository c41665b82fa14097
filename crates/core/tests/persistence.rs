use convnet_core::backend::CpuBackend;
use convnet_core::config::{ConvolutionConfig, LayerConfig, PoolingConfig};
use convnet_core::error::ConvError;
use convnet_core::layout::SampleLayout;
use convnet_core::nn::{
    AveragePoolingLayer, ComputationNode, ConvolutionLayer, MaxPoolingLayer, NodeShape,
};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Write};

fn conv_config() -> ConvolutionConfig {
    ConvolutionConfig {
        kernel_width: 5,
        kernel_height: 3,
        output_channels: 16,
        horizontal_stride: 2,
        vertical_stride: 1,
        zero_padding: true,
        max_temp_batch_size: 32,
    }
}

#[test]
fn convolution_record_survives_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conv.bin");
    let mut layer = ConvolutionLayer::new(CpuBackend, "conv1", conv_config()).unwrap();
    assert_eq!(layer.max_temp_batch_size(), 32);
    layer.set_max_temp_batch_size(8);
    assert_eq!(layer.max_temp_batch_size(), 8);

    {
        let mut writer = BufWriter::new(File::create(&path).unwrap());
        layer.save(&mut writer).unwrap();
        writer.flush().unwrap();
    }

    let mut reader = BufReader::new(File::open(&path).unwrap());
    let mut loaded = ConvolutionLayer::load(CpuBackend, "conv1", &mut reader).unwrap();
    assert_eq!(loaded.config(), ConvolutionConfig { max_temp_batch_size: 8, ..conv_config() });
    assert_eq!(loaded.input_layout(), None);

    // layouts are re-inferred rather than persisted
    let input = SampleLayout::new(12, 10, 3);
    layer.validate(&mut NodeShape::new(0, 0), &mut NodeShape::image(input, 1), true).unwrap();
    loaded.validate(&mut NodeShape::new(0, 0), &mut NodeShape::image(input, 1), true).unwrap();
    assert_eq!(layer.to_string(), loaded.to_string());
}

#[test]
fn pooling_records_are_typed() {
    let config = PoolingConfig {
        window_width: 3,
        window_height: 2,
        horizontal_stride: 3,
        vertical_stride: 1,
    };
    let max = MaxPoolingLayer::new(CpuBackend, "pool", config).unwrap();
    let mut bytes = Vec::new();
    max.save(&mut bytes).unwrap();

    let restored = MaxPoolingLayer::load(CpuBackend, "pool", &mut Cursor::new(&bytes)).unwrap();
    assert_eq!(restored.config(), config);
    assert_eq!(restored.type_name(), "MaxPooling");

    let err = AveragePoolingLayer::load(CpuBackend, "pool", &mut Cursor::new(&bytes))
        .err()
        .unwrap();
    assert!(matches!(err, ConvError::Serialization { .. }));
}

#[test]
fn truncated_and_corrupt_records_fail() {
    let layer = ConvolutionLayer::new(CpuBackend, "conv", conv_config()).unwrap();
    let mut bytes = Vec::new();
    layer.save(&mut bytes).unwrap();

    let truncated = &bytes[..bytes.len() - 3];
    assert!(ConvolutionLayer::load(CpuBackend, "conv", &mut Cursor::new(truncated)).is_err());

    // the padding flag is the byte before the trailing size
    let mut corrupt = bytes.clone();
    let flag = corrupt.len() - 9;
    corrupt[flag] = 7;
    let err = ConvolutionLayer::load(CpuBackend, "conv", &mut Cursor::new(&corrupt))
        .err()
        .unwrap();
    assert!(matches!(err, ConvError::Serialization { .. }));

    // zero kernel sizes are rejected even when read from disk
    let mut zeroed = bytes;
    let header = 8 + "Convolution".len() + 8;
    zeroed[header..header + 8].copy_from_slice(&0u64.to_le_bytes());
    let err = ConvolutionLayer::load(CpuBackend, "conv", &mut Cursor::new(&zeroed))
        .err()
        .unwrap();
    assert!(err.is_invalid_argument());
}

#[test]
fn copy_to_transfers_configuration_only_with_values() {
    let mut source = ConvolutionLayer::new(CpuBackend, "src", conv_config()).unwrap();
    source
        .validate(
            &mut NodeShape::new(0, 0),
            &mut NodeShape::image(SampleLayout::new(9, 9, 2), 1),
            true,
        )
        .unwrap();

    let small = ConvolutionConfig {
        kernel_width: 1,
        kernel_height: 1,
        output_channels: 1,
        horizontal_stride: 1,
        vertical_stride: 1,
        zero_padding: false,
        max_temp_batch_size: 0,
    };
    let mut target = ConvolutionLayer::new(CpuBackend, "dst", small).unwrap();
    source.copy_to(&mut target, false);
    assert_eq!(target.config(), small);

    source.copy_to(&mut target, true);
    assert_eq!(target.config(), source.config());
    assert_eq!(target.output_layout(), source.output_layout());
    assert_eq!(target.weight_shape(), Some((16, 30)));

    let pool_config = PoolingConfig {
        window_width: 2,
        window_height: 2,
        horizontal_stride: 2,
        vertical_stride: 2,
    };
    let mut pool_source = AveragePoolingLayer::new(CpuBackend, "a", pool_config).unwrap();
    pool_source
        .validate(&mut NodeShape::image(SampleLayout::new(4, 4, 3), 1), true)
        .unwrap();
    let mut pool_target =
        AveragePoolingLayer::new(CpuBackend, "b", PoolingConfig { window_width: 1, horizontal_stride: 1, ..pool_config })
            .unwrap();
    pool_source.copy_to(&mut pool_target, true);
    assert_eq!(pool_target.config(), pool_config);
    assert_eq!(pool_target.output_size_per_sample(), Some(12));
}

#[test]
fn layer_configs_load_from_json_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layer.json");
    fs::write(
        &path,
        r#"{ "type": "convolution", "kernel_width": 5, "kernel_height": 3,
             "output_channels": 16, "horizontal_stride": 2, "vertical_stride": 1,
             "zero_padding": true, "max_temp_batch_size": 32 }"#,
    )
    .unwrap();
    assert_eq!(LayerConfig::from_file(&path).unwrap(), LayerConfig::Convolution(conv_config()));

    let missing = dir.path().join("missing.json");
    assert!(LayerConfig::from_file(&missing).unwrap_err().is_invalid_argument());
}
