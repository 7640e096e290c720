use ffmpeg_next::{
    format::Pixel,
    frame,
    software::scaling::{Context, Flags},
};

/// Pixel format and size conversion in front of an FFmpeg encoder, or
/// behind a decoder producing a format the pipeline has no name for.
pub struct Scaler {
    context: Context,
    output: (Pixel, u32, u32),
}

// The scaling context is only touched from the owning stage worker.
unsafe impl Send for Scaler {}

impl Scaler {
    pub fn new(source: &frame::Video, format: Pixel, width: u32, height: u32) -> anyhow::Result<Self> {
        let context = Context::get(
            source.format(),
            source.width(),
            source.height(),
            format,
            width,
            height,
            Flags::BILINEAR,
        )?;
        Ok(Self {
            context,
            output: (format, width, height),
        })
    }

    /// True when frames shaped like `source` can go through this scaler.
    pub fn accepts(&self, source: &frame::Video) -> bool {
        let input = self.context.input();
        input.format == source.format()
            && input.width == source.width()
            && input.height == source.height()
    }

    pub fn output(&self) -> (Pixel, u32, u32) {
        self.output
    }

    pub fn run(&mut self, source: &frame::Video) -> anyhow::Result<frame::Video> {
        let (format, width, height) = self.output;
        let mut converted = frame::Video::new(format, width, height);
        self.context.run(source, &mut converted)?;
        converted.set_pts(source.pts());
        Ok(converted)
    }
}
