//! Container writer that hands its output to the caller instead of a file.
//!
//! Both containers go through a non-seekable callback and are drained after
//! every packet. MP4 is written fragmented so that nothing has to be patched
//! once the trailer is reached.

use std::ffi::{CString, c_int, c_void};
use std::ptr;

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Rational, ffi, packet};

use crate::{
    encoder::{AudioEncoder, VideoEncoder},
    packet::{EncodedPacket, NANOS},
};

const IO_BUFFER_SIZE: usize = 64 * 1024;
const MP4_MOVFLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

pub const VIDEO_STREAM: usize = 0;
pub const AUDIO_STREAM: usize = 1;

/// Target of the AVIO write callback.
#[derive(Default)]
struct IoSink {
    pending: Vec<Bytes>,
}

impl IoSink {
    fn write(&mut self, buf: &[u8]) {
        self.pending.push(Bytes::copy_from_slice(buf));
    }

    fn take(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.pending)
    }
}

type WritePacket = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || size <= 0 {
        return size.max(0);
    }
    let sink = unsafe { &mut *(opaque as *mut IoSink) };
    sink.write(unsafe { std::slice::from_raw_parts(buf, size as usize) });
    size
}

/// Muxer options that let `format` be written front to back.
fn header_options(format: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    if format == "mp4" {
        opts.set("movflags", MP4_MOVFLAGS);
    }
    opts
}

fn check(ret: c_int, what: &str) -> anyhow::Result<c_int> {
    if ret < 0 {
        anyhow::bail!("{}: {}", what, ffmpeg_next::Error::from(ret));
    }
    Ok(ret)
}

pub struct AvOutput {
    ctx: *mut ffi::AVFormatContext,
    io: *mut ffi::AVIOContext,
    sink: *mut IoSink,
    time_bases: [Rational; 2],
    have_written_trailer: bool,
}

// The raw contexts are owned exclusively by this value and only touched
// through `&mut self`.
unsafe impl Send for AvOutput {}

impl AvOutput {
    /// Opens `format` ("flv" or "mp4") with one video and one audio stream
    /// configured from the opened encoders, and writes the header.
    pub fn new(format: &str, video: &VideoEncoder, audio: &AudioEncoder) -> anyhow::Result<Self> {
        let cformat = CString::new(format)?;
        let sink = Box::into_raw(Box::new(IoSink::default()));

        let mut output = Self {
            ctx: ptr::null_mut(),
            io: ptr::null_mut(),
            sink,
            time_bases: [NANOS; 2],
            have_written_trailer: false,
        };

        unsafe {
            check(
                ffi::avformat_alloc_output_context2(
                    &mut output.ctx,
                    ptr::null(),
                    cformat.as_ptr(),
                    ptr::null(),
                ),
                "allocate output context",
            )?;
            if output.ctx.is_null() {
                anyhow::bail!("no muxer for format {}", format);
            }

            let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                anyhow::bail!("failed to allocate io buffer");
            }
            let write: WritePacket = write_packet;
            output.io = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                1,
                sink as *mut c_void,
                None,
                // The write callback's buffer argument changed constness
                // between FFmpeg releases; the ABI is identical.
                Some(std::mem::transmute(write)),
                None,
            );
            if output.io.is_null() {
                ffi::av_free(buffer as *mut c_void);
                anyhow::bail!("failed to allocate io context");
            }
            (*output.io).seekable = 0;
            (*output.ctx).pb = output.io;
            (*output.ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            for (index, (codec_ctx, time_base)) in [
                (video.context_ptr(), video.time_base()),
                (audio.context_ptr(), audio.time_base()),
            ]
            .into_iter()
            .enumerate()
            {
                let stream = ffi::avformat_new_stream(output.ctx, ptr::null());
                if stream.is_null() {
                    anyhow::bail!("failed to add stream {}", index);
                }
                check(
                    ffi::avcodec_parameters_from_context((*stream).codecpar, codec_ctx),
                    "copy codec parameters",
                )?;
                (*stream).time_base = time_base.into();
            }

            let mut opts = header_options(format).disown();
            let ret = ffi::avformat_write_header(output.ctx, &mut opts);
            Dictionary::own(opts);
            check(ret, "write header")?;
            ffi::avio_flush(output.io);

            for index in [VIDEO_STREAM, AUDIO_STREAM] {
                let stream = *(*output.ctx).streams.add(index);
                output.time_bases[index] = (*stream).time_base.into();
            }
        }

        log::info!("{} output opened", format);
        Ok(output)
    }

    /// Muxes one packet and returns the container bytes produced so far.
    pub fn write(
        &mut self,
        stream_index: usize,
        pkt: &EncodedPacket,
    ) -> anyhow::Result<Vec<Bytes>> {
        let time_base = *self
            .time_bases
            .get(stream_index)
            .ok_or(anyhow::anyhow!("stream not found: {}", stream_index))?;

        let mut av_packet = ffmpeg_next::Packet::copy(&pkt.data);
        av_packet.set_pts(Some(pkt.pts));
        av_packet.set_dts(Some(pkt.dts));
        av_packet.set_duration(pkt.duration);
        av_packet.set_stream(stream_index);
        av_packet.set_position(-1);
        if pkt.is_key {
            av_packet.set_flags(packet::Flags::KEY);
        }
        av_packet.rescale_ts(NANOS, time_base);

        unsafe {
            check(
                ffi::av_interleaved_write_frame(self.ctx, av_packet.as_mut_ptr()),
                "write packet",
            )?;
            ffi::avio_flush(self.io);
        }
        Ok(self.drain())
    }

    /// Writes the trailer and returns every remaining byte.
    pub fn finish(&mut self) -> anyhow::Result<Vec<Bytes>> {
        if self.have_written_trailer {
            return Ok(Vec::new());
        }
        self.have_written_trailer = true;
        unsafe {
            check(ffi::av_write_trailer(self.ctx), "write trailer")?;
            ffi::avio_flush(self.io);
        }

        Ok(self.drain())
    }

    fn drain(&mut self) -> Vec<Bytes> {
        unsafe { &mut *self.sink }.take()
    }
}

impl Drop for AvOutput {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                (*self.ctx).pb = ptr::null_mut();
                ffi::avformat_free_context(self.ctx);
                self.ctx = ptr::null_mut();
            }
            if !self.io.is_null() {
                ffi::av_freep(&mut (*self.io).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.io);
            }
            if !self.sink.is_null() {
                drop(Box::from_raw(self.sink));
                self.sink = ptr::null_mut();
            }
        }
    }
}
