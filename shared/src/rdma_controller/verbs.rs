//! Queue pairs on real hardware through libibverbs.

use std::{
    collections::VecDeque,
    ffi::CStr,
    mem::{zeroed, MaybeUninit},
    os::fd::BorrowedFd,
    ptr::null_mut,
    slice,
    time::Duration,
};

use nix::poll::{poll, PollFd, PollFlags};
use rdma_sys::*;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    session::poll_timeout,
};

use super::{
    check_range, memory_region::MemoryRegion, Config, Device, Opcode, QpInfo, QpType, QueuePair,
    WcOpcode, WcStatus, WorkCompletion, WorkRequest,
};

const QKEY: u32 = 0x1111_1111;
const POLL_BATCH: usize = 16;

/// Opens queue pairs on the named device, or the first one present.
#[derive(Debug, Default)]
pub struct VerbsDevice;

impl VerbsDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Device for VerbsDevice {
    fn name(&self) -> &str {
        "verbs"
    }

    fn open(&self, config: &Config) -> Result<Box<dyn QueuePair>> {
        let mut qp = VerbsQp::empty(config.clone());
        qp.setup()?;
        Ok(Box::new(qp))
    }
}

pub struct VerbsQp {
    ctx: *mut ibv_context,
    pd: *mut ibv_pd,
    channel: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    ah: *mut ibv_ah,
    mr: Option<MemoryRegion>,
    port_attr: ibv_port_attr,
    gid: [u8; 16],
    psn: u32,
    remote: Option<QpInfo>,
    armed: bool,
    ready: VecDeque<WorkCompletion>,
    config: Config,
}

// the raw handles are only used by the owning session's thread
unsafe impl Send for VerbsQp {}

fn failed(what: &str) -> Error {
    Error::Rdma(format!("{what}: {}", std::io::Error::last_os_error()))
}

impl VerbsQp {
    fn empty(config: Config) -> Self {
        Self {
            ctx: null_mut(),
            pd: null_mut(),
            channel: null_mut(),
            cq: null_mut(),
            qp: null_mut(),
            ah: null_mut(),
            mr: None,
            port_attr: unsafe { zeroed() },
            gid: [0; 16],
            psn: rand::random::<u32>() & 0xff_ffff,
            remote: None,
            armed: false,
            ready: VecDeque::new(),
            config,
        }
    }

    fn setup(&mut self) -> Result<()> {
        unsafe {
            self.open_device()?;

            self.pd = ibv_alloc_pd(self.ctx);
            if self.pd.is_null() {
                return Err(failed("failed to allocate protection domain"));
            }

            let ret = ibv_query_port(
                self.ctx,
                self.config.port,
                &mut self.port_attr as *mut ibv_port_attr as *mut _,
            );
            if ret != 0 {
                return Err(Error::Rdma(format!(
                    "failed to query port {}: {ret}",
                    self.config.port
                )));
            }
            if self.port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
                return Err(Error::Rdma(format!("port {} is not active", self.config.port)));
            }

            let mut gid: ibv_gid = zeroed();
            if ibv_query_gid(self.ctx, self.config.port, 0, &mut gid) == 0 {
                self.gid = gid.raw;
            }

            self.channel = ibv_create_comp_channel(self.ctx);
            if self.channel.is_null() {
                return Err(failed("failed to create completion channel"));
            }

            let cqe = (self.config.max_send_wr + self.config.max_recv_wr) as i32;
            self.cq = ibv_create_cq(self.ctx, cqe, null_mut(), self.channel, 0);
            if self.cq.is_null() {
                return Err(failed("failed to create completion queue"));
            }

            let mr = MemoryRegion::register(self.pd, self.config.buffer_size)
                .map_err(|e| Error::io("registering memory region", e))?;
            self.mr = Some(mr);

            let mut init_attr = ibv_qp_init_attr {
                qp_type: match self.config.qp_type {
                    QpType::Rc => ibv_qp_type::IBV_QPT_RC,
                    QpType::Uc => ibv_qp_type::IBV_QPT_UC,
                    QpType::Ud => ibv_qp_type::IBV_QPT_UD,
                },
                send_cq: self.cq,
                recv_cq: self.cq,
                cap: ibv_qp_cap {
                    max_send_wr: self.config.max_send_wr,
                    max_recv_wr: self.config.max_recv_wr,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    ..zeroed()
                },
                ..zeroed()
            };
            self.qp = ibv_create_qp(self.pd, &mut init_attr);
            if self.qp.is_null() {
                return Err(failed("failed to create queue pair"));
            }

            self.to_init()?;
            info!(
                "opened {} queue pair {} on port {}",
                self.config.qp_type.name(),
                (*self.qp).qp_num,
                self.config.port
            );
        }
        Ok(())
    }

    unsafe fn open_device(&mut self) -> Result<()> {
        let mut count = 0;
        let list = ibv_get_device_list(&mut count);
        if list.is_null() {
            return Err(failed("failed to get IB device list"));
        }

        let devices = slice::from_raw_parts(list, count.max(0) as usize);
        let found = devices.iter().copied().find(|&device| {
            let name = CStr::from_ptr(ibv_get_device_name(device));
            match &self.config.device {
                None => true,
                Some(wanted) => name.to_str() == Ok(wanted.as_str()),
            }
        });

        let result = match found {
            Some(device) => {
                self.ctx = ibv_open_device(device);
                if self.ctx.is_null() {
                    Err(failed("failed to open IB device"))
                } else {
                    debug!(
                        "opened device {:?}",
                        CStr::from_ptr(ibv_get_device_name(device))
                    );
                    Ok(())
                }
            }
            None => Err(Error::Rdma(match &self.config.device {
                Some(name) => format!("no RDMA device named {name}"),
                None => "no RDMA devices found".into(),
            })),
        };

        ibv_free_device_list(list);
        result
    }

    fn modify(&mut self, attr: &mut ibv_qp_attr, mask: ibv_qp_attr_mask, to: &str) -> Result<()> {
        let ret = unsafe { ibv_modify_qp(self.qp, attr, mask.0 as i32) };
        if ret != 0 {
            return Err(Error::Rdma(format!(
                "failed to modify queue pair to {to}: {}",
                std::io::Error::from_raw_os_error(ret)
            )));
        }
        Ok(())
    }

    fn to_init(&mut self) -> Result<()> {
        let mut attr = ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_INIT,
            pkey_index: 0,
            port_num: self.config.port,
            ..unsafe { zeroed() }
        };
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT;

        match self.config.qp_type {
            QpType::Ud => {
                attr.qkey = QKEY;
                mask = mask | ibv_qp_attr_mask::IBV_QP_QKEY;
            }
            QpType::Uc => {
                attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                    .0;
                mask = mask | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
            QpType::Rc => {
                attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                    .0;
                mask = mask | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            }
        }

        self.modify(&mut attr, mask, "INIT")
    }

    fn address(&self, remote: &QpInfo) -> ibv_ah_attr {
        let mut ah_attr = ibv_ah_attr {
            is_global: 0,
            dlid: remote.lid,
            sl: self.config.service_level,
            src_path_bits: self.config.src_path_bits,
            static_rate: self.config.static_rate,
            port_num: self.config.port,
            ..unsafe { zeroed() }
        };
        if remote.is_global() {
            ah_attr.is_global = 1;
            ah_attr.grh.dgid.raw = remote.gid;
            ah_attr.grh.sgid_index = 0;
            ah_attr.grh.hop_limit = 1;
        }
        ah_attr
    }

    fn mr(&self) -> Result<&MemoryRegion> {
        self.mr
            .as_ref()
            .ok_or_else(|| Error::Internal("queue pair has no registered memory".into()))
    }

    fn poll_into(&mut self, out: &mut VecDeque<WorkCompletion>, max: usize) -> Result<usize> {
        const WC_INIT: MaybeUninit<ibv_wc> = MaybeUninit::zeroed();
        let mut wc_buffer = [WC_INIT; POLL_BATCH];
        let max = max.min(POLL_BATCH);

        let polled = unsafe { ibv_poll_cq(self.cq, max as i32, wc_buffer.as_mut_ptr().cast()) };
        if polled < 0 {
            return Err(Error::Rdma(format!("failed to poll completion queue: {polled}")));
        }

        for wc in &wc_buffer[..polled as usize] {
            out.push_back(convert(unsafe { wc.assume_init_ref() }));
        }
        Ok(polled as usize)
    }
}

fn convert(wc: &ibv_wc) -> WorkCompletion {
    let opcode = match wc.opcode {
        ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::Write,
        ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::Read,
        ibv_wc_opcode::IBV_WC_COMP_SWAP => WcOpcode::CompareSwap,
        ibv_wc_opcode::IBV_WC_FETCH_ADD => WcOpcode::FetchAdd,
        ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvImm,
        _ => WcOpcode::Recv,
    };
    let status = if wc.status == ibv_wc_status::IBV_WC_SUCCESS {
        WcStatus::Success
    } else {
        let text = unsafe { CStr::from_ptr(ibv_wc_status_str(wc.status)) };
        WcStatus::Failed(text.to_string_lossy().into_owned())
    };
    WorkCompletion {
        wr_id: wc.wr_id,
        opcode,
        status,
        byte_len: wc.byte_len,
    }
}

impl QueuePair for VerbsQp {
    fn qp_type(&self) -> QpType {
        self.config.qp_type
    }

    fn local_info(&self) -> QpInfo {
        let (rkey, vaddr) = self
            .mr
            .as_ref()
            .map(|mr| (mr.rkey, mr.addr()))
            .unwrap_or_default();
        QpInfo {
            lid: self.port_attr.lid,
            qpn: unsafe { (*self.qp).qp_num },
            psn: self.psn,
            qkey: QKEY,
            gid: self.gid,
            rkey,
            vaddr,
        }
    }

    fn connect(&mut self, remote: &QpInfo) -> Result<()> {
        let qp_type = self.config.qp_type;
        let mut attr = ibv_qp_attr {
            qp_state: ibv_qp_state::IBV_QPS_RTR,
            ..unsafe { zeroed() }
        };
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE;

        if qp_type != QpType::Ud {
            attr.path_mtu = match self.config.mtu {
                256 => ibv_mtu::IBV_MTU_256,
                512 => ibv_mtu::IBV_MTU_512,
                1024 => ibv_mtu::IBV_MTU_1024,
                4096 => ibv_mtu::IBV_MTU_4096,
                _ => ibv_mtu::IBV_MTU_2048,
            };
            attr.dest_qp_num = remote.qpn;
            attr.rq_psn = remote.psn;
            attr.ah_attr = self.address(remote);
            mask = mask
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN;
        }
        if qp_type == QpType::Rc {
            attr.max_dest_rd_atomic = self.config.rd_atomic;
            attr.min_rnr_timer = 12;
            mask = mask
                | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        }
        self.modify(&mut attr, mask, "RTR")?;

        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = self.psn;
        let mut mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
        if qp_type == QpType::Rc {
            attr.timeout = 14;
            attr.retry_cnt = 7;
            attr.rnr_retry = 7;
            attr.max_rd_atomic = self.config.rd_atomic;
            mask = mask
                | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        }
        self.modify(&mut attr, mask, "RTS")?;

        if qp_type == QpType::Ud {
            let mut ah_attr = self.address(remote);
            self.ah = unsafe { ibv_create_ah(self.pd, &mut ah_attr) };
            if self.ah.is_null() {
                return Err(failed("failed to create address handle"));
            }
        }

        self.remote = Some(*remote);
        debug!("connected to queue pair {}", remote.qpn);
        Ok(())
    }

    fn post_send(&mut self, wr: &WorkRequest) -> Result<()> {
        let mr = self.mr()?;
        check_range("send", wr.offset, wr.len, mr.bytes().len())?;

        let mut list = ibv_sge {
            addr: mr.addr() + wr.offset as u64,
            length: wr.len as u32,
            lkey: mr.lkey,
        };

        let mut send_wr: ibv_send_wr = unsafe { zeroed() };
        send_wr.wr_id = wr.wr_id;
        send_wr.sg_list = &mut list;
        send_wr.num_sge = 1;
        send_wr.send_flags = if wr.signaled {
            ibv_send_flags::IBV_SEND_SIGNALED.0
        } else {
            0
        };

        match wr.opcode {
            Opcode::Send => {
                send_wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
                if self.config.qp_type == QpType::Ud {
                    let remote = self.remote.ok_or_else(|| {
                        Error::Rdma("datagram queue pair has no destination".into())
                    })?;
                    send_wr.wr.ud.ah = self.ah;
                    send_wr.wr.ud.remote_qpn = remote.qpn;
                    send_wr.wr.ud.remote_qkey = remote.qkey;
                }
            }
            Opcode::Write | Opcode::WriteImm(_) | Opcode::Read => {
                send_wr.opcode = match wr.opcode {
                    Opcode::Write => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
                    Opcode::Read => ibv_wr_opcode::IBV_WR_RDMA_READ,
                    _ => ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
                };
                if let Opcode::WriteImm(imm) = wr.opcode {
                    send_wr.__bindgen_anon_1.imm_data = imm.to_be();
                }
                send_wr.wr.rdma.remote_addr = wr.remote_addr;
                send_wr.wr.rdma.rkey = wr.rkey;
            }
            Opcode::CompareSwap { compare, swap } => {
                send_wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
                send_wr.wr.atomic.remote_addr = wr.remote_addr;
                send_wr.wr.atomic.rkey = wr.rkey;
                send_wr.wr.atomic.compare_add = compare;
                send_wr.wr.atomic.swap = swap;
            }
            Opcode::FetchAdd(add) => {
                send_wr.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
                send_wr.wr.atomic.remote_addr = wr.remote_addr;
                send_wr.wr.atomic.rkey = wr.rkey;
                send_wr.wr.atomic.compare_add = add;
            }
        }

        let mut bad_wr = null_mut();
        let ret = unsafe { ibv_post_send(self.qp, &mut send_wr, &mut bad_wr) };
        if ret != 0 {
            return Err(Error::Rdma(format!(
                "failed to post send: {}",
                std::io::Error::from_raw_os_error(ret)
            )));
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, offset: usize, len: usize) -> Result<()> {
        let mr = self.mr()?;
        check_range("receive", offset, len, mr.bytes().len())?;

        let mut list = ibv_sge {
            addr: mr.addr() + offset as u64,
            length: len as u32,
            lkey: mr.lkey,
        };
        let mut recv_wr = ibv_recv_wr {
            wr_id,
            sg_list: &mut list,
            num_sge: 1,
            ..unsafe { zeroed() }
        };

        let mut bad_wr = null_mut();
        let ret = unsafe { ibv_post_recv(self.qp, &mut recv_wr, &mut bad_wr) };
        if ret != 0 {
            return Err(Error::Rdma(format!(
                "failed to post receive: {}",
                std::io::Error::from_raw_os_error(ret)
            )));
        }
        Ok(())
    }

    fn poll(&mut self, completions: &mut Vec<WorkCompletion>, max: usize) -> Result<usize> {
        let mut polled = 0;
        while polled < max {
            match self.ready.pop_front() {
                Some(wc) => {
                    completions.push(wc);
                    polled += 1;
                }
                None => break,
            }
        }
        if polled < max {
            let mut fresh = VecDeque::new();
            polled += self.poll_into(&mut fresh, max - polled)?;
            completions.extend(fresh);
        }
        Ok(polled)
    }

    fn wait_completion(&mut self, timeout: Duration) -> Result<bool> {
        if !self.ready.is_empty() {
            return Ok(true);
        }
        if !self.armed {
            if unsafe { ibv_req_notify_cq(self.cq, 0) } != 0 {
                return Err(failed("failed to request completion notification"));
            }
            self.armed = true;

            // anything that completed before arming raises no event
            let mut ready = VecDeque::new();
            self.poll_into(&mut ready, POLL_BATCH)?;
            if !ready.is_empty() {
                self.ready = ready;
                return Ok(true);
            }
        }

        let fd = unsafe { BorrowedFd::borrow_raw((*self.channel).fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout(timeout)) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(false),
            Err(e) => return Err(Error::os("poll completion channel", e)),
        }

        let mut ev_cq = null_mut();
        let mut ev_ctx = null_mut();
        if unsafe { ibv_get_cq_event(self.channel, &mut ev_cq, &mut ev_ctx) } != 0 {
            return Err(failed("failed to get completion event"));
        }
        unsafe { ibv_ack_cq_events(ev_cq, 1) };
        self.armed = false;
        Ok(true)
    }

    fn write_local(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let mr = self
            .mr
            .as_mut()
            .ok_or_else(|| Error::Internal("queue pair has no registered memory".into()))?;
        let bytes = mr.bytes_mut();
        check_range("local write", offset, data.len(), bytes.len())?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_local(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let bytes = self.mr()?.bytes();
        check_range("local read", offset, out.len(), bytes.len())?;
        // the adapter writes this memory behind our back
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = unsafe { std::ptr::read_volatile(bytes.as_ptr().add(offset + i)) };
        }
        Ok(())
    }

    fn buffer_len(&self) -> usize {
        self.mr.as_ref().map(|mr| mr.bytes().len()).unwrap_or(0)
    }

    fn mtu(&self) -> u32 {
        self.config.mtu
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        unsafe {
            if !self.qp.is_null() {
                ibv_destroy_qp(self.qp);
            }
            if !self.ah.is_null() {
                ibv_destroy_ah(self.ah);
            }
            if !self.cq.is_null() {
                ibv_destroy_cq(self.cq);
            }
            if !self.channel.is_null() {
                ibv_destroy_comp_channel(self.channel);
            }
            self.mr.take();
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibv_close_device(self.ctx);
            }
        }
    }
}
