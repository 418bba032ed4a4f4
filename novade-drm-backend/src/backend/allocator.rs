// novade-drm-backend/src/backend/allocator.rs
//! Mode resolution and encoder/CRTC assignment.

use std::collections::HashMap;

use tracing::debug;

use super::OutputId;
use crate::config::ModeRequest;
use crate::errors::{AllocationError, ModeSelectError};
use crate::kms::{ConnectorInfo, CrtcHandle, DisplayMode, EncoderHandle, KmsDevice};

/// Resolves a textual mode request against the advertised modes.
///
/// `previous` is the mode the output was driven with before, used by
/// `current` requests.
pub fn select_mode<'a>(
    modes: &'a [DisplayMode],
    previous: Option<&DisplayMode>,
    request: &str,
) -> Result<&'a DisplayMode, ModeSelectError> {
    let request: ModeRequest = request.parse()?;
    resolve_mode(modes, previous, &request)
}

pub fn resolve_mode<'a>(
    modes: &'a [DisplayMode],
    previous: Option<&DisplayMode>,
    request: &ModeRequest,
) -> Result<&'a DisplayMode, ModeSelectError> {
    match request {
        ModeRequest::Preferred => modes
            .first()
            .ok_or_else(|| ModeSelectError::NoMatchingMode(request.clone())),
        ModeRequest::Current => {
            let previous = previous.ok_or(ModeSelectError::NoPreviousMode)?;
            modes
                .iter()
                .find(|mode| *mode == previous)
                .ok_or(ModeSelectError::CurrentModeMissing)
        }
        ModeRequest::Resolution { width, height, refresh } => modes
            .iter()
            .find(|mode| {
                mode.size() == (*width, *height)
                    && refresh.map_or(true, |refresh| mode.refresh() == refresh)
            })
            .ok_or_else(|| ModeSelectError::NoMatchingMode(request.clone())),
    }
}

/// Which output owns which CRTC. Scoped to one device.
///
/// A CRTC is owned by at most one output at a time.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrtcClaims {
    owners: HashMap<CrtcHandle, OutputId>,
}

impl CrtcClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self, crtc: CrtcHandle) -> Option<OutputId> {
        self.owners.get(&crtc).copied()
    }

    pub fn is_claimed(&self, crtc: CrtcHandle) -> bool {
        self.owners.contains_key(&crtc)
    }

    /// Claims `crtc` for `owner`. Returns `false` if it is already taken.
    pub fn claim(&mut self, crtc: CrtcHandle, owner: OutputId) -> bool {
        if self.is_claimed(crtc) {
            return false;
        }
        self.owners.insert(crtc, owner);
        true
    }

    /// Releases every CRTC held by `owner`.
    pub fn release_owner(&mut self, owner: OutputId) {
        self.owners.retain(|_, held_by| *held_by != owner);
    }

    pub fn claimed_by(&self, owner: OutputId) -> Vec<CrtcHandle> {
        let mut crtcs: Vec<_> = self
            .owners
            .iter()
            .filter(|(_, held_by)| **held_by == owner)
            .map(|(crtc, _)| *crtc)
            .collect();
        crtcs.sort();
        crtcs
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Greedy first fit: walks the connector's encoders in platform order and, for
/// each, the CRTCs it can drive in index order, claiming the first free one.
///
/// `crtcs` is the device's CRTC list; positions in it are the bit indices of
/// the encoders' `possible_crtcs` masks. Unreadable encoders are skipped.
pub fn allocate_crtc<K: KmsDevice + ?Sized>(
    kms: &K,
    connector: &ConnectorInfo,
    crtcs: &[CrtcHandle],
    claims: &mut CrtcClaims,
    owner: OutputId,
) -> Result<(EncoderHandle, CrtcHandle), AllocationError> {
    for &encoder in &connector.encoders {
        let info = match kms.encoder_info(encoder) {
            Ok(info) => info,
            Err(err) => {
                debug!(encoder = encoder.0, "Skipping unreadable encoder: {}", err);
                continue;
            }
        };

        let free = crtcs
            .iter()
            .enumerate()
            .filter(|(index, _)| info.supports_crtc_index(*index))
            .map(|(_, crtc)| *crtc)
            .find(|crtc| !claims.is_claimed(*crtc));

        if let Some(crtc) = free {
            claims.claim(crtc, owner);
            return Ok((encoder, crtc));
        }
    }

    Err(AllocationError::NoCrtcAvailable { connector: connector.handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::ConnectorHandle;
    use crate::testing::{mode, MockKms};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn advertised() -> Vec<DisplayMode> {
        vec![mode(1920, 1080, 60), mode(1280, 720, 60), mode(1280, 720, 50)]
    }

    #[rstest]
    #[case("preferred", Some(0))]
    #[case("1280x720", Some(1))]
    #[case("1280x720@50", Some(2))]
    #[case("1280x720@30", None)]
    #[case("800x600", None)]
    fn selects_by_request(#[case] request: &str, #[case] expected: Option<usize>) {
        let modes = advertised();
        let selected = select_mode(&modes, None, request).ok();
        assert_eq!(selected, expected.map(|index| &modes[index]));
    }

    #[test]
    fn preferred_is_always_the_first_entry() {
        let modes = vec![mode(640, 480, 75), mode(3840, 2160, 60)];
        assert_eq!(select_mode(&modes, None, "preferred"), Ok(&modes[0]));
    }

    #[test]
    fn current_without_previous_mode_fails() {
        let modes = advertised();
        assert_eq!(select_mode(&modes, None, "current"), Err(ModeSelectError::NoPreviousMode));
    }

    #[test]
    fn current_matches_the_whole_timing_record() {
        let modes = advertised();
        let mut previous = modes[2].clone();
        assert_eq!(select_mode(&modes, Some(&previous), "current"), Ok(&modes[2]));

        previous.clock += 1;
        assert_eq!(
            select_mode(&modes, Some(&previous), "current"),
            Err(ModeSelectError::CurrentModeMissing)
        );
    }

    #[test]
    fn malformed_request_is_rejected() {
        let modes = advertised();
        assert!(matches!(
            select_mode(&modes, None, "1920x1080@"),
            Err(ModeSelectError::InvalidRequest(_))
        ));
    }

    #[test]
    fn no_modes_never_resolves() {
        assert!(select_mode(&[], None, "preferred").is_err());
    }

    #[test]
    fn claims_are_exclusive() {
        let mut claims = CrtcClaims::new();
        let (a, b) = (OutputId::new(0), OutputId::new(1));

        assert!(claims.claim(CrtcHandle(40), a));
        assert!(!claims.claim(CrtcHandle(40), b));
        assert_eq!(claims.owner(CrtcHandle(40)), Some(a));

        claims.claim(CrtcHandle(41), b);
        claims.release_owner(a);
        assert!(!claims.is_claimed(CrtcHandle(40)));
        assert_eq!(claims.claimed_by(b), vec![CrtcHandle(41)]);
        claims.release_owner(b);
        assert!(claims.is_empty());
    }

    #[test]
    fn allocation_is_greedy_first_fit() {
        let kms = MockKms::new();
        let crtcs = [CrtcHandle(40), CrtcHandle(41), CrtcHandle(42)];
        kms.add_crtc(crtcs[0]);
        kms.add_crtc(crtcs[1]);
        kms.add_crtc(crtcs[2]);
        // Encoder 30 can drive CRTC index 1 and 2, encoder 31 only index 0.
        kms.add_encoder(EncoderHandle(30), 0b110);
        kms.add_encoder(EncoderHandle(31), 0b001);
        let info = kms.add_connector(ConnectorHandle(10), &[EncoderHandle(30), EncoderHandle(31)]);

        let mut claims = CrtcClaims::new();
        let first = allocate_crtc(&kms, &info, &crtcs, &mut claims, OutputId::new(0)).unwrap();
        let second = allocate_crtc(&kms, &info, &crtcs, &mut claims, OutputId::new(1)).unwrap();
        let third = allocate_crtc(&kms, &info, &crtcs, &mut claims, OutputId::new(2)).unwrap();

        assert_eq!(first, (EncoderHandle(30), CrtcHandle(41)));
        assert_eq!(second, (EncoderHandle(30), CrtcHandle(42)));
        assert_eq!(third, (EncoderHandle(31), CrtcHandle(40)));
        assert!(matches!(
            allocate_crtc(&kms, &info, &crtcs, &mut claims, OutputId::new(3)),
            Err(AllocationError::NoCrtcAvailable { connector: ConnectorHandle(10) })
        ));
        assert_eq!(claims.len(), 3);
    }

    #[test]
    fn unreadable_encoders_are_skipped() {
        let kms = MockKms::new();
        let crtcs = [CrtcHandle(40)];
        kms.add_crtc(crtcs[0]);
        kms.add_encoder(EncoderHandle(31), 0b1);
        // Encoder 30 is advertised but not known to the device.
        let info = kms.add_connector(ConnectorHandle(10), &[EncoderHandle(30), EncoderHandle(31)]);

        let mut claims = CrtcClaims::new();
        let allocated = allocate_crtc(&kms, &info, &crtcs, &mut claims, OutputId::new(0)).unwrap();
        assert_eq!(allocated, (EncoderHandle(31), CrtcHandle(40)));
    }
}
