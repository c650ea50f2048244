//! The flattened form of a file datatype:  a list of `(index, length)` segments describing the
//! bytes one repeat of the type touches.  Writes against a view tile the flattened filetype across
//! the file; the helpers here enumerate the contiguous segments an access lands on.

///////////////////////////////////////////// Typemap //////////////////////////////////////////////

/// A flattened datatype.  `indices[i]` is the byte offset of segment `i` from the start of the
/// type and `blocklens[i]` is its length.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Typemap {
    indices: Vec<i64>,
    blocklens: Vec<i64>,
}

impl Typemap {
    /// A single contiguous segment of `len` bytes.
    pub fn contiguous(len: i64) -> Self {
        assert!(len > 0);
        Self {
            indices: vec![0],
            blocklens: vec![len],
        }
    }

    /// The single-byte type.
    pub fn byte() -> Self {
        Self::contiguous(1)
    }

    /// `count` segments of `blocklen` bytes placed every `stride` bytes.
    pub fn strided(blocklen: i64, stride: i64, count: usize) -> Self {
        assert!(blocklen > 0);
        assert!(stride >= blocklen);
        assert!(count > 0);
        let mut indices = Vec::with_capacity(count);
        let mut blocklens = Vec::with_capacity(count);
        for i in 0..count {
            indices.push(i as i64 * stride);
            blocklens.push(blocklen);
        }
        Self { indices, blocklens }
    }

    /// Assemble a typemap from raw parts, e.g. as decoded from a VIEW record.
    pub fn from_parts(indices: Vec<i64>, blocklens: Vec<i64>) -> Self {
        assert_eq!(indices.len(), blocklens.len());
        Self { indices, blocklens }
    }

    /// The number of segments.
    pub fn count(&self) -> usize {
        self.indices.len()
    }

    /// The number of bytes one repeat of the type carries.
    pub fn size(&self) -> i64 {
        self.blocklens.iter().sum()
    }

    /// The span from the first segment's start to the last segment's end.  Tiling repeats the
    /// type at this stride.
    pub fn extent(&self) -> i64 {
        if self.indices.is_empty() {
            return 0;
        }
        let last = self.indices.len() - 1;
        self.indices[last] + self.blocklens[last] - self.indices[0]
    }

    /// True iff the segments form one unbroken run.
    pub fn is_contiguous(&self) -> bool {
        let mut last = match (self.indices.first(), self.blocklens.first()) {
            (Some(index), Some(len)) => index + len,
            _ => return true,
        };
        for (index, len) in self.indices.iter().zip(self.blocklens.iter()).skip(1) {
            if *index != last {
                return false;
            }
            last = index + len;
        }
        true
    }

    /// The segment start offsets.
    pub fn indices(&self) -> &[i64] {
        &self.indices
    }

    /// The segment lengths.
    pub fn blocklens(&self) -> &[i64] {
        &self.blocklens
    }

    /// Append the wire form:  `{count: i64, indices: i64[count], blocklens: i64[count]}`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.indices.len() as i64).to_ne_bytes());
        for index in self.indices.iter() {
            out.extend_from_slice(&index.to_ne_bytes());
        }
        for len in self.blocklens.iter() {
            out.extend_from_slice(&len.to_ne_bytes());
        }
    }
}

//////////////////////////////////////////// calc_access ///////////////////////////////////////////

/// Enumerate the contiguous canonical-file segments a write of `writesize` bytes touches, given
/// the view `(etype_size, ftype, disp)` and an offset counted in etypes.  The emit callback
/// returns false to stop; `calc_access` returns true iff it ran to completion.
pub fn calc_access<F: FnMut(i64, i64) -> bool>(
    etype_size: i64,
    ftype: &Typemap,
    disp: i64,
    offset: i64,
    writesize: i64,
    emit: &mut F,
) -> bool {
    if writesize <= 0 {
        return true;
    }
    let base = disp + offset * etype_size;
    let fsize = ftype.size();
    if ftype.is_contiguous() || fsize <= 0 {
        return emit(base, writesize);
    }
    let ext = ftype.extent();
    let first = ftype.indices()[0];
    let full = writesize / fsize;
    let mut rem = writesize % fsize;
    for i in 0..full {
        for (index, len) in ftype.indices().iter().zip(ftype.blocklens().iter()) {
            if *len == 0 {
                continue;
            }
            if !emit(base + i * ext + index - first, *len) {
                return false;
            }
        }
    }
    let tail = base + full * ext;
    for (index, len) in ftype.indices().iter().zip(ftype.blocklens().iter()) {
        if rem <= 0 {
            break;
        }
        let take = std::cmp::min(rem, *len);
        if take > 0 && !emit(tail + index - first, take) {
            return false;
        }
        rem -= take;
    }
    true
}

//////////////////////////////////////////// calc_range ////////////////////////////////////////////

/// The first and last byte a write of `writesize` bytes touches under the view, without
/// enumerating every repeat.
pub fn calc_range(
    etype_size: i64,
    ftype: &Typemap,
    disp: i64,
    offset: i64,
    writesize: i64,
) -> (i64, i64) {
    let base = disp + offset * etype_size;
    if writesize <= 0 {
        return (base, base);
    }
    let fsize = ftype.size();
    if ftype.is_contiguous() || fsize <= 0 {
        return (base, base + writesize);
    }
    let ext = ftype.extent();
    let first = ftype.indices()[0];
    let full = writesize / fsize;
    let mut rem = writesize % fsize;
    if rem == 0 {
        return (base, base + full * ext);
    }
    let tail = base + full * ext;
    let mut stop = tail;
    for (index, len) in ftype.indices().iter().zip(ftype.blocklens().iter()) {
        if rem <= 0 {
            break;
        }
        let take = std::cmp::min(rem, *len);
        if take > 0 {
            stop = tail + index - first + take;
        }
        rem -= take;
    }
    (base, stop)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
