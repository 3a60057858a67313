//! Atom names and protocol constants shared by every PCP peer.

use super::AtomName;

/// Protocol version advertised in HELO/OLEH/HOST/BCST.
pub const PCP_VERSION: u32 = 1218;
/// Value carried by the `pcp\n` connect atom.
pub const PCP_CONNECT_VERSION: u32 = 1;

pub mod name {
    use super::AtomName;

    pub const CONNECT: AtomName = AtomName::new(b"pcp\n");
    pub const OK: AtomName = AtomName::new(b"ok");

    pub const HELO: AtomName = AtomName::new(b"helo");
    pub const HELO_AGENT: AtomName = AtomName::new(b"agnt");
    pub const HELO_OSID: AtomName = AtomName::new(b"osid");
    pub const HELO_SESSION_ID: AtomName = AtomName::new(b"sid");
    pub const HELO_PORT: AtomName = AtomName::new(b"port");
    pub const HELO_PING: AtomName = AtomName::new(b"ping");
    pub const HELO_PONG: AtomName = AtomName::new(b"pong");
    pub const HELO_REMOTE_IP: AtomName = AtomName::new(b"rip");
    pub const HELO_VERSION: AtomName = AtomName::new(b"ver");
    pub const HELO_BCID: AtomName = AtomName::new(b"bcid");
    pub const HELO_DISABLE: AtomName = AtomName::new(b"dis");

    pub const OLEH: AtomName = AtomName::new(b"oleh");

    pub const CHAN: AtomName = AtomName::new(b"chan");
    pub const CHAN_ID: AtomName = AtomName::new(b"id");
    pub const CHAN_BCID: AtomName = AtomName::new(b"bcid");
    pub const CHAN_KEY: AtomName = AtomName::new(b"key");

    pub const CHAN_PKT: AtomName = AtomName::new(b"pkt");
    pub const CHAN_PKT_TYPE: AtomName = AtomName::new(b"type");
    pub const CHAN_PKT_POS: AtomName = AtomName::new(b"pos");
    pub const CHAN_PKT_DATA: AtomName = AtomName::new(b"data");
    pub const CHAN_PKT_CONTINUATION: AtomName = AtomName::new(b"cont");

    pub const CHAN_INFO: AtomName = AtomName::new(b"info");
    pub const CHAN_INFO_TYPE: AtomName = AtomName::new(b"type");
    pub const CHAN_INFO_STREAM_TYPE: AtomName = AtomName::new(b"styp");
    pub const CHAN_INFO_STREAM_EXT: AtomName = AtomName::new(b"sext");
    pub const CHAN_INFO_BITRATE: AtomName = AtomName::new(b"bitr");
    pub const CHAN_INFO_GENRE: AtomName = AtomName::new(b"gnre");
    pub const CHAN_INFO_NAME: AtomName = AtomName::new(b"name");
    pub const CHAN_INFO_URL: AtomName = AtomName::new(b"url");
    pub const CHAN_INFO_DESC: AtomName = AtomName::new(b"desc");
    pub const CHAN_INFO_COMMENT: AtomName = AtomName::new(b"cmnt");
    pub const CHAN_INFO_PPFLAGS: AtomName = AtomName::new(b"pflg");

    pub const CHAN_TRACK: AtomName = AtomName::new(b"trck");
    pub const CHAN_TRACK_TITLE: AtomName = AtomName::new(b"titl");
    pub const CHAN_TRACK_CREATOR: AtomName = AtomName::new(b"crea");
    pub const CHAN_TRACK_URL: AtomName = AtomName::new(b"url");
    pub const CHAN_TRACK_ALBUM: AtomName = AtomName::new(b"albm");
    pub const CHAN_TRACK_GENRE: AtomName = AtomName::new(b"genr");

    pub const BCST: AtomName = AtomName::new(b"bcst");
    pub const BCST_TTL: AtomName = AtomName::new(b"ttl");
    pub const BCST_HOPS: AtomName = AtomName::new(b"hops");
    pub const BCST_FROM: AtomName = AtomName::new(b"from");
    pub const BCST_DEST: AtomName = AtomName::new(b"dest");
    pub const BCST_GROUP: AtomName = AtomName::new(b"grp");
    pub const BCST_CHANID: AtomName = AtomName::new(b"cid");
    pub const BCST_VERSION: AtomName = AtomName::new(b"vers");
    pub const BCST_VERSION_VP: AtomName = AtomName::new(b"vrvp");
    pub const BCST_VERSION_EX_PREFIX: AtomName = AtomName::new(b"vexp");
    pub const BCST_VERSION_EX_NUMBER: AtomName = AtomName::new(b"vexn");

    pub const HOST: AtomName = AtomName::new(b"host");
    pub const HOST_ID: AtomName = AtomName::new(b"id");
    pub const HOST_IP: AtomName = AtomName::new(b"ip");
    pub const HOST_PORT: AtomName = AtomName::new(b"port");
    pub const HOST_NUML: AtomName = AtomName::new(b"numl");
    pub const HOST_NUMR: AtomName = AtomName::new(b"numr");
    pub const HOST_UPTIME: AtomName = AtomName::new(b"uptm");
    pub const HOST_CHANID: AtomName = AtomName::new(b"cid");
    pub const HOST_VERSION: AtomName = AtomName::new(b"ver");
    pub const HOST_VERSION_VP: AtomName = AtomName::new(b"vevp");
    pub const HOST_VERSION_EX_PREFIX: AtomName = AtomName::new(b"vexp");
    pub const HOST_VERSION_EX_NUMBER: AtomName = AtomName::new(b"vexn");
    pub const HOST_CLAP_PP: AtomName = AtomName::new(b"clap");
    pub const HOST_OLDPOS: AtomName = AtomName::new(b"oldp");
    pub const HOST_NEWPOS: AtomName = AtomName::new(b"newp");
    pub const HOST_FLAGS1: AtomName = AtomName::new(b"flg1");
    pub const HOST_UPHOST_IP: AtomName = AtomName::new(b"upip");
    pub const HOST_UPHOST_PORT: AtomName = AtomName::new(b"uppt");
    pub const HOST_UPHOST_HOPS: AtomName = AtomName::new(b"uphp");

    pub const QUIT: AtomName = AtomName::new(b"quit");
}

/// `CHAN_PKT_TYPE` payloads.
pub mod packet_type {
    pub const HEAD: &[u8] = b"head";
    pub const DATA: &[u8] = b"data";
    pub const META: &[u8] = b"meta";
}

/// Values carried by `QUIT`: a family base plus a reason.
pub mod quit {
    pub const QUIT: u32 = 1000;
    pub const BCST: u32 = 2000;
    pub const READ: u32 = 3000;
    pub const WRITE: u32 = 4000;
    pub const GENERAL: u32 = 5000;

    pub const SKIP: u32 = 1;
    pub const ALREADY_CONNECTED: u32 = 2;
    pub const UNAVAILABLE: u32 = 3;
    pub const LOOPBACK: u32 = 4;
    pub const NOT_IDENTIFIED: u32 = 5;
    pub const BAD_RESPONSE: u32 = 6;
    pub const BAD_AGENT: u32 = 7;
    pub const OFF_AIR: u32 = 8;
    pub const SHUTDOWN: u32 = 9;
    pub const NO_ROOT: u32 = 10;
    pub const BANNED: u32 = 11;
}

/// Bits of `HOST_FLAGS1`. RELAY, DIRECT and CIN are set while capacity remains,
/// so "full" is the cleared bit.
pub mod host_flags {
    pub const TRACKER: u8 = 0x01;
    pub const RELAY: u8 = 0x02;
    pub const DIRECT: u8 = 0x04;
    pub const PUSH: u8 = 0x08;
    pub const RECV: u8 = 0x10;
    pub const CIN: u8 = 0x20;
    pub const PRIVATE: u8 = 0x40;
}
