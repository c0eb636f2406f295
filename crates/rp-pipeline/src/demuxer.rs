//! Metadata loading over a [`RangeSource`].

use bytes::Bytes;
use rp_core::{BoxLocation, MediaInfo, ResourceSize};
use rp_media::{refine_after_payload, scan, DemuxError, Layout, REFINE_HEADER_LEN};
use rp_source::RangeSource;

/// Loads the structure of a progressive MP4 with as few range requests as
/// the layout allows.
pub struct Demuxer;

impl Demuxer {
    /// Fetch the probe window, locate and fetch `moov`, and parse it.
    ///
    /// All or nothing: any failure leaves no partial metadata behind.
    /// Transport failures surface as `SOURCE_LOAD_FAILURE`, everything else
    /// as `DEMUX_ERROR`.
    pub async fn load_metadata(
        source: &dyn RangeSource,
        probe_window: u64,
    ) -> rp_core::Result<MediaInfo> {
        let window = source
            .fetch_range_with_size(0, probe_window.saturating_sub(1))
            .await?;
        let total = window.total_size;
        let scanned = scan(&window.data, total)?;

        let moov = match scanned.layout {
            Layout::MoovFirst => scanned.moov,
            Layout::PayloadFirst => {
                let start = scanned.moov.start();
                let header_end = start
                    .saturating_add(REFINE_HEADER_LEN - 1)
                    .min(scanned.moov.end());
                let header = source.fetch_range(start, header_end).await?;
                refine_after_payload(&header, scanned.moov, total)?
            }
        };

        let moov_bytes = Self::moov_bytes(source, &window.data, moov).await?;
        let info = rp_media::parse_moov(&moov_bytes)?;
        Self::check_sample_ranges(&info, total)?;

        tracing::info!(
            layout = ?scanned.layout,
            %moov,
            %total,
            samples = info.video.samples.len(),
            codec = %info.video.decoder_config.codec,
            "Loaded metadata"
        );
        Ok(info)
    }

    /// Every video sample must lie inside the resource.
    fn check_sample_ranges(info: &MediaInfo, total: ResourceSize) -> rp_core::Result<()> {
        for sample in &info.video.samples {
            let range = sample.byte_range()?;
            if !range.fits_within(total) {
                return Err(DemuxError::inconsistent(format!(
                    "sample {} at {range} lies outside the {total} resource",
                    sample.index
                ))
                .into());
            }
        }
        Ok(())
    }

    /// The moov bytes, reusing the probe window when it already holds them.
    async fn moov_bytes(
        source: &dyn RangeSource,
        window: &Bytes,
        moov: BoxLocation,
    ) -> rp_core::Result<Bytes> {
        if moov.end() < window.len() as u64 {
            return Ok(window.slice(moov.start() as usize..=moov.end() as usize));
        }
        let bytes = source.fetch_range(moov.start(), moov.end()).await?;
        if (bytes.len() as u64) < moov.len() {
            return Err(DemuxError::malformed(format!(
                "moov at {moov} is {} bytes but only {} arrived",
                moov.len(),
                bytes.len()
            ))
            .into());
        }
        Ok(bytes)
    }
}
