//! Tile payloads: the array data stored in the cells of a tile grid and handed to processing
//! functions. A payload is either a dynamic-dimensional numeric array or a list of payloads, the
//! latter being used for tiles which cannot be stacked into a single array (for example a
//! variable number of detected coordinates per tile).

use crate::errors::TileError;
use crate::Result;
use ndarray::{concatenate, stack, Array, ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use num_traits::Zero;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    U32(ArrayD<u32>),
    List(Vec<Payload>),
}

impl From<ArrayD<f32>> for Payload {
    fn from(value: ArrayD<f32>) -> Self {
        Payload::F32(value)
    }
}

impl From<ArrayD<f64>> for Payload {
    fn from(value: ArrayD<f64>) -> Self {
        Payload::F64(value)
    }
}

impl From<ArrayD<u32>> for Payload {
    fn from(value: ArrayD<u32>) -> Self {
        Payload::U32(value)
    }
}

impl From<Vec<Payload>> for Payload {
    fn from(value: Vec<Payload>) -> Self {
        Payload::List(value)
    }
}

impl Payload {
    /// A short name for the element type, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::F32(_) => "f32",
            Payload::F64(_) => "f64",
            Payload::U32(_) => "u32",
            Payload::List(_) => "list",
        }
    }

    /// The shape of the payload. A list reports its length as a one-dimensional shape.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Payload::F32(a) => a.shape().to_vec(),
            Payload::F64(a) => a.shape().to_vec(),
            Payload::U32(a) => a.shape().to_vec(),
            Payload::List(v) => vec![v.len()],
        }
    }

    /// The number of entries along the leading axis.
    pub fn len(&self) -> usize {
        self.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_labels(&self) -> Option<&ArrayD<u32>> {
        match self {
            Payload::U32(a) => Some(a),
            _ => None,
        }
    }

    /// Extract entry `i` along the leading axis.
    pub fn index_axis0(&self, i: usize) -> Result<Payload> {
        let len = self.len();
        if i >= len || self.shape().is_empty() {
            return Err(TileError::PayloadMismatch(format!(
                "index {i} out of bounds for a leading axis of length {len}"
            )));
        }
        Ok(match self {
            Payload::F32(a) => Payload::F32(a.index_axis(Axis(0), i).to_owned()),
            Payload::F64(a) => Payload::F64(a.index_axis(Axis(0), i).to_owned()),
            Payload::U32(a) => Payload::U32(a.index_axis(Axis(0), i).to_owned()),
            Payload::List(v) => v[i].clone(),
        })
    }

    /// Insert a new leading axis of length one.
    pub fn insert_axis0(self) -> Payload {
        match self {
            Payload::F32(a) => Payload::F32(a.insert_axis(Axis(0))),
            Payload::F64(a) => Payload::F64(a.insert_axis(Axis(0))),
            Payload::U32(a) => Payload::U32(a.insert_axis(Axis(0))),
            Payload::List(v) => Payload::List(vec![Payload::List(v)]),
        }
    }

    /// Concatenate `other` onto this payload along the leading axis.
    pub fn concat_axis0(&self, other: &Payload) -> Result<Payload> {
        Ok(match (self, other) {
            (Payload::F32(a), Payload::F32(b)) => {
                Payload::F32(concatenate(Axis(0), &[a.view(), b.view()])?)
            }
            (Payload::F64(a), Payload::F64(b)) => {
                Payload::F64(concatenate(Axis(0), &[a.view(), b.view()])?)
            }
            (Payload::U32(a), Payload::U32(b)) => {
                Payload::U32(concatenate(Axis(0), &[a.view(), b.view()])?)
            }
            (Payload::List(a), Payload::List(b)) => {
                Payload::List(a.iter().chain(b.iter()).cloned().collect())
            }
            (a, b) => return Err(mismatch(a, b)),
        })
    }

    /// Stack payloads along a new leading axis. Every payload must be an array of the same
    /// element type and shape.
    pub fn stack(items: &[Payload]) -> Result<Payload> {
        let Some(first) = items.first() else {
            return Err(TileError::PayloadMismatch("cannot stack zero payloads".into()));
        };
        Ok(match first {
            Payload::F32(_) => Payload::F32(stack_views(items, |p| match p {
                Payload::F32(a) => Some(a.view()),
                _ => None,
            })?),
            Payload::F64(_) => Payload::F64(stack_views(items, |p| match p {
                Payload::F64(a) => Some(a.view()),
                _ => None,
            })?),
            Payload::U32(_) => Payload::U32(stack_views(items, |p| match p {
                Payload::U32(a) => Some(a.view()),
                _ => None,
            })?),
            Payload::List(_) => {
                return Err(TileError::PayloadMismatch(
                    "list payloads cannot be stacked into an array".into(),
                ));
            }
        })
    }

    /// Zero-pad the leading axis with `count` additional entries.
    pub fn pad_axis0(&self, count: usize) -> Result<Payload> {
        self.pad_axis(0, count)
    }

    /// Zero-pad the end of `axis` with `count` additional entries. Lists are padded with empty
    /// lists along their only axis.
    pub fn pad_axis(&self, axis: usize, count: usize) -> Result<Payload> {
        if count == 0 {
            return Ok(self.clone());
        }
        Ok(match self {
            Payload::F32(a) => Payload::F32(pad_array(a, axis, count)?),
            Payload::F64(a) => Payload::F64(pad_array(a, axis, count)?),
            Payload::U32(a) => Payload::U32(pad_array(a, axis, count)?),
            Payload::List(v) => {
                let mut padded = v.clone();
                padded.extend((0..count).map(|_| Payload::List(Vec::new())));
                Payload::List(padded)
            }
        })
    }

    /// Cut out a rectangle from the two trailing (spatial) axes, keeping every leading axis.
    pub fn crop_spatial(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Payload> {
        Ok(match self {
            Payload::F32(a) => Payload::F32(crop_array(a, rows, cols)?),
            Payload::F64(a) => Payload::F64(crop_array(a, rows, cols)?),
            Payload::U32(a) => Payload::U32(crop_array(a, rows, cols)?),
            Payload::List(_) => {
                return Err(TileError::PayloadMismatch(
                    "list payloads have no spatial axes".into(),
                ));
            }
        })
    }

    /// An array of zeros of the same element type, with the given shape.
    pub fn zeros_like(&self, shape: &[usize]) -> Result<Payload> {
        Ok(match self {
            Payload::F32(_) => Payload::F32(ArrayD::zeros(IxDyn(shape))),
            Payload::F64(_) => Payload::F64(ArrayD::zeros(IxDyn(shape))),
            Payload::U32(_) => Payload::U32(ArrayD::zeros(IxDyn(shape))),
            Payload::List(_) => {
                return Err(TileError::PayloadMismatch(
                    "list payloads have no zero value".into(),
                ));
            }
        })
    }

    /// Copy `source` into the spatial rectangle `rows` x `cols` of this payload. Leading axes
    /// must match.
    pub fn assign_spatial(
        &mut self,
        rows: Range<usize>,
        cols: Range<usize>,
        source: &Payload,
    ) -> Result<()> {
        match (self, source) {
            (Payload::F32(a), Payload::F32(b)) => assign_array(a, rows, cols, b.view()),
            (Payload::F64(a), Payload::F64(b)) => assign_array(a, rows, cols, b.view()),
            (Payload::U32(a), Payload::U32(b)) => assign_array(a, rows, cols, b.view()),
            (a, b) => Err(mismatch(a, b)),
        }
    }
}

fn mismatch(a: &Payload, b: &Payload) -> TileError {
    TileError::PayloadMismatch(format!(
        "cannot combine {} payload with {} payload",
        a.type_name(),
        b.type_name()
    ))
}

fn stack_views<'a, T, F>(items: &'a [Payload], view: F) -> Result<ArrayD<T>>
where
    T: Clone + 'a,
    F: Fn(&'a Payload) -> Option<ArrayViewD<'a, T>>,
{
    let views = items
        .iter()
        .map(|p| {
            view(p).ok_or_else(|| {
                TileError::PayloadMismatch(format!(
                    "cannot stack a {} payload with {} payloads",
                    p.type_name(),
                    items[0].type_name()
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(stack(Axis(0), &views)?)
}

fn pad_array<T: Clone + Zero>(a: &ArrayD<T>, axis: usize, count: usize) -> Result<ArrayD<T>> {
    if axis >= a.ndim() {
        return Err(TileError::PayloadMismatch(format!(
            "cannot pad axis {axis} of a {}-dimensional payload",
            a.ndim()
        )));
    }
    let mut shape = a.shape().to_vec();
    shape[axis] = count;
    let zeros: ArrayD<T> = Array::zeros(IxDyn(&shape));
    Ok(concatenate(Axis(axis), &[a.view(), zeros.view()])?)
}

fn spatial_slicer(ndim: usize, rows: Range<usize>, cols: Range<usize>) -> impl Fn(usize) -> Slice {
    move |axis| {
        if axis + 2 == ndim {
            Slice::from(rows.clone())
        } else if axis + 1 == ndim {
            Slice::from(cols.clone())
        } else {
            Slice::from(..)
        }
    }
}

fn check_spatial(shape: &[usize], rows: &Range<usize>, cols: &Range<usize>) -> Result<()> {
    let fits = match shape {
        [.., h, w] => {
            rows.start <= rows.end && rows.end <= *h && cols.start <= cols.end && cols.end <= *w
        }
        _ => false,
    };
    if !fits {
        return Err(TileError::PayloadMismatch(format!(
            "rectangle {rows:?} x {cols:?} does not fit a payload of shape {shape:?}"
        )));
    }
    Ok(())
}

fn crop_array<T: Clone>(
    a: &ArrayD<T>,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Result<ArrayD<T>> {
    check_spatial(a.shape(), &rows, &cols)?;
    let slicer = spatial_slicer(a.ndim(), rows, cols);
    Ok(a.slice_each_axis(|d| slicer(d.axis.index())).to_owned())
}

fn assign_array<T: Clone>(
    a: &mut ArrayD<T>,
    rows: Range<usize>,
    cols: Range<usize>,
    source: ArrayViewD<'_, T>,
) -> Result<()> {
    check_spatial(a.shape(), &rows, &cols)?;
    let slicer = spatial_slicer(a.ndim(), rows, cols);
    let mut target = a.slice_each_axis_mut(|d| slicer(d.axis.index()));
    if target.shape() != source.shape() {
        return Err(TileError::PayloadMismatch(format!(
            "cannot assign shape {:?} into region of shape {:?}",
            source.shape(),
            target.shape()
        )));
    }
    target.assign(&source);
    Ok(())
}
