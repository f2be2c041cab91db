use crate::{address, instruction::WarpInstruction};
use bitvec::BitArr;

pub const READ_PACKET_SIZE: u8 = 8;
pub const WRITE_PACKET_SIZE: u8 = 8;

pub const MAX_MEMORY_ACCESS_SIZE: usize = 128;
pub type ByteMask = BitArr!(for MAX_MEMORY_ACCESS_SIZE);

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    READ_REQUEST = 0,
    WRITE_REQUEST,
    READ_REPLY,
    WRITE_ACK,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    INITIALIZED,
    IN_ICNT_TO_MEM,
    IN_ICNT_TO_SHADER,
    IN_CLUSTER_TO_SHADER_QUEUE,
    IN_SHADER_LDST_RESPONSE_FIFO,
    IN_SHADER_FETCHED,
    DELETED,
}

pub mod access {
    use crate::warp::ActiveMask;

    #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
    #[derive(
        Debug,
        strum::EnumIter,
        strum::EnumCount,
        Clone,
        Copy,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
    )]
    pub enum Kind {
        GLOBAL_ACC_R,
        LOCAL_ACC_R,
        CONST_ACC_R,
        TEXTURE_ACC_R,
        GLOBAL_ACC_W,
        LOCAL_ACC_W,
        INST_ACC_R,
        L1_WRBK_ACC,
    }

    impl Kind {
        #[must_use]
        pub fn is_global(self) -> bool {
            matches!(self, Kind::GLOBAL_ACC_R | Kind::GLOBAL_ACC_W)
        }

        #[must_use]
        pub fn is_local(self) -> bool {
            matches!(self, Kind::LOCAL_ACC_R | Kind::LOCAL_ACC_W)
        }

        #[must_use]
        pub fn is_texture(self) -> bool {
            self == Kind::TEXTURE_ACC_R
        }

        #[must_use]
        pub fn is_const(self) -> bool {
            self == Kind::CONST_ACC_R
        }

        #[must_use]
        pub fn is_write(self) -> bool {
            matches!(
                self,
                Kind::GLOBAL_ACC_W | Kind::LOCAL_ACC_W | Kind::L1_WRBK_ACC
            )
        }
    }

    /// One coalesced memory request generated by a load or store.
    #[allow(clippy::module_name_repetitions)]
    #[derive(Clone, PartialEq, Eq, Hash)]
    pub struct MemAccess {
        pub addr: super::address,
        pub kind: Kind,
        pub is_write: bool,
        pub req_size_bytes: u32,
        /// Active mask of the warp fragment that issued this access.
        pub warp_active_mask: ActiveMask,
        pub byte_mask: super::ByteMask,
    }

    impl MemAccess {
        #[must_use]
        pub fn new(kind: Kind, addr: super::address, req_size_bytes: u32) -> Self {
            Self {
                addr,
                kind,
                is_write: kind.is_write(),
                req_size_bytes,
                warp_active_mask: ActiveMask::ZERO,
                byte_mask: super::ByteMask::ZERO,
            }
        }

        #[must_use]
        pub fn control_size(&self) -> u32 {
            if self.is_write {
                u32::from(super::WRITE_PACKET_SIZE)
            } else {
                u32::from(super::READ_PACKET_SIZE)
            }
        }

        /// Bytes transferred over the interconnect for this access.
        #[must_use]
        pub fn size(&self) -> u32 {
            if self.is_write {
                // write data travels with the request
                self.req_size_bytes + self.control_size()
            } else {
                self.control_size()
            }
        }
    }

    impl std::fmt::Debug for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.debug_struct("MemAccess")
                .field("kind", &self.kind)
                .field("addr", &self.addr)
                .field("req_size_bytes", &self.req_size_bytes)
                .field("is_write", &self.is_write)
                .finish()
        }
    }

    impl std::fmt::Display for MemAccess {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{:?}@{}", self.kind, self.addr)
        }
    }
}

/// One in-flight memory request crossing the core boundary.
#[derive(Clone)]
pub struct MemFetch {
    pub uid: u64,
    pub access: access::MemAccess,
    /// Issuing instruction, carried so the response can writeback.
    pub instr: Option<WarpInstruction>,
    pub warp_id: usize,
    pub core_id: usize,
    pub cluster_id: usize,
    pub kind: Kind,
    pub status: Status,
}

impl MemFetch {
    #[must_use]
    pub fn new(
        uid: u64,
        access: access::MemAccess,
        instr: Option<WarpInstruction>,
        warp_id: usize,
        core_id: usize,
        cluster_id: usize,
    ) -> Self {
        let kind = if access.is_write {
            Kind::WRITE_REQUEST
        } else {
            Kind::READ_REQUEST
        };
        Self {
            uid,
            access,
            instr,
            warp_id,
            core_id,
            cluster_id,
            kind,
            status: Status::INITIALIZED,
        }
    }

    #[must_use]
    pub fn access_kind(&self) -> access::Kind {
        self.access.kind
    }

    #[must_use]
    pub fn addr(&self) -> address {
        self.access.addr
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access.is_write
    }

    #[must_use]
    pub fn is_texture(&self) -> bool {
        self.access.kind.is_texture()
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.access.kind.is_const()
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.instr.as_ref().is_some_and(|i| i.is_atomic)
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.access.size()
    }

    /// Turn a serviced request into its reply.
    pub fn set_reply(&mut self) {
        self.kind = match self.kind {
            Kind::READ_REQUEST => Kind::READ_REPLY,
            Kind::WRITE_REQUEST => Kind::WRITE_ACK,
            reply => reply,
        };
    }
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}({})", self.kind, self.access)
    }
}

impl std::fmt::Debug for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemFetch")
            .field("uid", &self.uid)
            .field("kind", &self.kind)
            .field("access", &self.access)
            .field("warp_id", &self.warp_id)
            .field("status", &self.status)
            .finish()
    }
}
