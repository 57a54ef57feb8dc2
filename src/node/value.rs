//! The value node: the trivial node with one EOF value and no branches,
//! used when a value is too large to inline in a leaf.

use crate::header::AllocHeader;

use super::{NodeBase, NODE_BASE_SIZE};

#[repr(C)]
struct ValueHead {
    base: NodeBase,
    val_len: u32,
}

const HEAD_SIZE: usize = NODE_BASE_SIZE + 4;

#[derive(Clone, Copy)]
pub struct ValueView<'a> {
    head: &'a ValueHead,
}

impl<'a> ValueView<'a> {
    /// # Safety
    ///
    /// `header` must start a live value-node allocation.
    pub unsafe fn from_header(header: &'a AllocHeader) -> Self {
        Self {
            head: &*(header as *const AllocHeader as *const ValueHead),
        }
    }

    pub fn base(&self) -> &'a NodeBase {
        &self.head.base
    }

    pub fn value(&self) -> &'a [u8] {
        unsafe {
            std::slice::from_raw_parts(
                (self.head as *const ValueHead as *const u8).add(HEAD_SIZE),
                self.head.val_len as usize,
            )
        }
    }

    pub fn validate(&self) -> bool {
        HEAD_SIZE + self.head.val_len as usize <= self.head.base.header.size() as usize
    }
}

pub struct ValueBuilder;

impl ValueBuilder {
    pub fn size_for(value_len: usize) -> usize {
        HEAD_SIZE + value_len
    }

    /// # Safety
    ///
    /// `buf` must be a fresh allocation with a valid header at its start.
    pub unsafe fn build(buf: &mut [u8], value: &[u8]) {
        let head = &mut *(buf.as_mut_ptr() as *mut ValueHead);
        head.base.init(0, 0, 1, 0);
        head.val_len = value.len() as u32;
        buf[HEAD_SIZE..HEAD_SIZE + value.len()].copy_from_slice(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::PtrAddressSeq;
    use crate::header::round_up_cacheline;
    use crate::node::TYPE_VALUE;

    #[test]
    fn roundtrip() {
        let payload = vec![7u8; 5000];
        let size = round_up_cacheline(ValueBuilder::size_for(payload.len()));
        let mut buf = vec![0u8; size];
        let h = AllocHeader::new(size as u32, TYPE_VALUE, PtrAddressSeq::NULL);
        buf[..12].copy_from_slice(bytemuck::bytes_of(&h));
        unsafe { ValueBuilder::build(&mut buf, &payload) };
        let view = unsafe { ValueView::from_header(&*(buf.as_ptr() as *const AllocHeader)) };
        assert!(view.validate());
        assert_eq!(view.value(), payload.as_slice());
    }
}
