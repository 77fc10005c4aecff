//! The writable 1-D histogram: `TH1D` v3 over `TH1` v8 with `TAxis` v10
//! axes, the layout the read-side model understands.

use crate::serialization;
use crate::ObjectBits;

fn tarrayd(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 * values.len());
    out.extend_from_slice(&(values.len() as i32).to_be_bytes());
    for value in values {
        out.extend_from_slice(&value.to_be_bytes());
    }
    out
}

fn framed(version: u16, body: Vec<u8>) -> Vec<u8> {
    let mut out = serialization::numbytes_version(body.len(), version).to_vec();
    out.extend_from_slice(&body);
    out
}

/// TAttLine v2 with default line attributes.
fn attline() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&602i16.to_be_bytes()); // fLineColor
    body.extend_from_slice(&1i16.to_be_bytes()); // fLineStyle
    body.extend_from_slice(&1i16.to_be_bytes()); // fLineWidth
    framed(2, body)
}

/// TAttFill v2 with default fill attributes.
fn attfill() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0i16.to_be_bytes()); // fFillColor
    body.extend_from_slice(&1001i16.to_be_bytes()); // fFillStyle
    framed(2, body)
}

/// TAttMarker v2 with default marker attributes.
fn attmarker() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&1i16.to_be_bytes()); // fMarkerColor
    body.extend_from_slice(&1i16.to_be_bytes()); // fMarkerStyle
    body.extend_from_slice(&1.0f32.to_be_bytes()); // fMarkerSize
    framed(2, body)
}

/// TAttAxis v4 with ROOT's default axis attributes.
fn attaxis() -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&510i32.to_be_bytes()); // fNdivisions
    body.extend_from_slice(&1i16.to_be_bytes()); // fAxisColor
    body.extend_from_slice(&1i16.to_be_bytes()); // fLabelColor
    body.extend_from_slice(&42i16.to_be_bytes()); // fLabelFont
    body.extend_from_slice(&0.005f32.to_be_bytes()); // fLabelOffset
    body.extend_from_slice(&0.035f32.to_be_bytes()); // fLabelSize
    body.extend_from_slice(&0.03f32.to_be_bytes()); // fTickLength
    body.extend_from_slice(&1.0f32.to_be_bytes()); // fTitleOffset
    body.extend_from_slice(&0.035f32.to_be_bytes()); // fTitleSize
    body.extend_from_slice(&1i16.to_be_bytes()); // fTitleColor
    body.extend_from_slice(&42i16.to_be_bytes()); // fTitleFont
    framed(4, body)
}

/// TAxis v10.
fn taxis(name: &str, num_bins: i32, low: f64, up: f64, edges: &[f64]) -> Vec<u8> {
    let mut body = serialization::tnamed(name, "", 0);
    body.extend_from_slice(&attaxis());
    body.extend_from_slice(&num_bins.to_be_bytes());
    body.extend_from_slice(&low.to_be_bytes());
    body.extend_from_slice(&up.to_be_bytes());
    body.extend_from_slice(&tarrayd(edges)); // fXbins
    body.extend_from_slice(&0i32.to_be_bytes()); // fFirst
    body.extend_from_slice(&0i32.to_be_bytes()); // fLast
    body.extend_from_slice(&0u16.to_be_bytes()); // fBits2
    body.push(0); // fTimeDisplay
    body.extend_from_slice(&serialization::string("")); // fTimeFormat
    body.extend_from_slice(&[0; 4]); // fLabels (null)
    body.extend_from_slice(&[0; 4]); // fModLabs (null)
    framed(10, body)
}

/// An empty, framed TList v5.
fn empty_tlist() -> Vec<u8> {
    let mut body = serialization::tobject(0).to_vec();
    body.extend_from_slice(&serialization::string("")); // fName
    body.extend_from_slice(&0i32.to_be_bytes()); // fSize
    framed(5, body)
}

/// A 1-D histogram of doubles, ready to be serialized into a directory.
///
/// `contents` includes the underflow and overflow bins, so its length is the
/// number of visible bins plus two.
#[derive(Clone, Debug)]
pub struct Histogram1D {
    pub title: String,
    pub x_low: f64,
    pub x_up: f64,
    /// Explicit bin edges for non-uniform binning; empty means uniform over
    /// `[x_low, x_up]`.
    pub edges: Vec<f64>,
    /// Bin contents including underflow and overflow.
    pub contents: Vec<f64>,
    /// Per-bin sum of squared weights; empty if not tracked.
    pub sumw2: Vec<f64>,
    pub entries: f64,
    pub tsumw: f64,
    pub tsumw2: f64,
    pub tsumwx: f64,
    pub tsumwx2: f64,
}

impl Histogram1D {
    /// A histogram whose entry count and weight sums are derived from the
    /// contents (every fill assumed to have unit weight).
    pub fn from_contents(
        title: impl Into<String>,
        contents: Vec<f64>,
        x_low: f64,
        x_up: f64,
    ) -> Histogram1D {
        let entries: f64 = contents.iter().sum();
        let num_bins = contents.len().saturating_sub(2).max(1);
        let width = (x_up - x_low) / num_bins as f64;
        let mut tsumw = 0.0;
        let mut tsumwx = 0.0;
        let mut tsumwx2 = 0.0;
        for (bin, &weight) in contents.iter().enumerate().skip(1).take(num_bins) {
            let center = x_low + (bin as f64 - 0.5) * width;
            tsumw += weight;
            tsumwx += weight * center;
            tsumwx2 += weight * center * center;
        }
        Histogram1D {
            title: title.into(),
            x_low,
            x_up,
            edges: Vec::new(),
            contents,
            sumw2: Vec::new(),
            entries,
            tsumw,
            tsumw2: tsumw,
            tsumwx,
            tsumwx2,
        }
    }

    pub fn num_bins(&self) -> usize {
        self.contents.len().saturating_sub(2)
    }

    /// Serializes the full `TH1D` record (uncompressed payload bytes).
    pub fn serialize(&self, name: &str) -> Vec<u8> {
        let mut th1 = serialization::tnamed(name, &self.title, ObjectBits::MUST_CLEANUP.bits());
        th1.extend_from_slice(&attline());
        th1.extend_from_slice(&attfill());
        th1.extend_from_slice(&attmarker());
        th1.extend_from_slice(&(self.contents.len() as i32).to_be_bytes()); // fNcells
        th1.extend_from_slice(&taxis(
            "xaxis",
            self.num_bins() as i32,
            self.x_low,
            self.x_up,
            &self.edges,
        ));
        th1.extend_from_slice(&taxis("yaxis", 1, 0.0, 1.0, &[]));
        th1.extend_from_slice(&taxis("zaxis", 1, 0.0, 1.0, &[]));
        th1.extend_from_slice(&0i16.to_be_bytes()); // fBarOffset
        th1.extend_from_slice(&1000i16.to_be_bytes()); // fBarWidth
        for value in [
            self.entries,
            self.tsumw,
            self.tsumw2,
            self.tsumwx,
            self.tsumwx2,
            -1111.0, // fMaximum
            -1111.0, // fMinimum
            0.0,     // fNormFactor
        ] {
            th1.extend_from_slice(&value.to_be_bytes());
        }
        th1.extend_from_slice(&tarrayd(&[])); // fContour
        th1.extend_from_slice(&tarrayd(&self.sumw2)); // fSumw2
        th1.extend_from_slice(&serialization::string("")); // fOption
        th1.extend_from_slice(&empty_tlist()); // fFunctions
        th1.extend_from_slice(&0i32.to_be_bytes()); // fBufferSize
        th1.push(0); // speedbump before the empty fBuffer
        th1.extend_from_slice(&0i32.to_be_bytes()); // fBinStatErrOpt
        th1.extend_from_slice(&2i32.to_be_bytes()); // fStatOverflows (neutral)

        let mut body = framed(8, th1);
        body.extend_from_slice(&tarrayd(&self.contents)); // fArray
        framed(3, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_statistics_count_visible_bins_only() {
        let hist = Histogram1D::from_contents(
            "test",
            vec![1.0, 2.0, 3.0, 4.0], // underflow, two bins, overflow
            0.0,
            2.0,
        );
        assert_eq!(hist.num_bins(), 2);
        assert_eq!(hist.entries, 10.0);
        assert_eq!(hist.tsumw, 5.0);
    }
}
