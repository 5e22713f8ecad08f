use ffmpeg_next::{
    ChannelLayout,
    format::{Pixel, Sample, sample::Type},
    frame,
};

/// Copies a tightly packed I420 buffer into an FFmpeg frame, honouring the
/// frame's line strides.
pub fn i420_frame(data: &[u8], width: u32, height: u32) -> anyhow::Result<frame::Video> {
    let (w, h) = (width as usize, height as usize);
    let planes = [(w, h), (w / 2, h / 2), (w / 2, h / 2)];
    let need: usize = planes.iter().map(|(pw, ph)| pw * ph).sum();
    if data.len() < need {
        anyhow::bail!(
            "I420 buffer of {} bytes is too small for {}x{} ({} bytes)",
            data.len(),
            width,
            height,
            need
        );
    }

    let mut frame = frame::Video::new(Pixel::YUV420P, width, height);
    let mut offset = 0;
    for (index, (pw, ph)) in planes.into_iter().enumerate() {
        let stride = frame.stride(index);
        let dst = frame.data_mut(index);
        for row in 0..ph {
            let src = &data[offset + row * pw..offset + (row + 1) * pw];
            dst[row * stride..row * stride + pw].copy_from_slice(src);
        }
        offset += pw * ph;
    }
    Ok(frame)
}

/// Builds a planar float mono frame, the input layout of the AAC encoder.
pub fn mono_f32_frame(samples: &[f32], rate: u32) -> frame::Audio {
    let mut frame = frame::Audio::new(
        Sample::F32(Type::Planar),
        samples.len(),
        ChannelLayout::MONO,
    );
    frame.set_rate(rate);
    frame.plane_mut::<f32>(0)[..samples.len()].copy_from_slice(samples);
    frame
}
