use crate::error::{EngineError, Result};

/// Well-known TCP ports and their service labels, sorted by port.
const WELL_KNOWN: &[(u16, &str)] = &[
    (20, "FTP-DATA"),
    (21, "FTP"),
    (22, "SSH"),
    (23, "TELNET"),
    (25, "SMTP"),
    (53, "DNS"),
    (69, "TFTP"),
    (80, "HTTP"),
    (88, "Kerberos"),
    (110, "POP3"),
    (111, "RPCBind"),
    (135, "MSRPC"),
    (137, "NetBIOS-NS"),
    (138, "NetBIOS-DGM"),
    (139, "NetBIOS-SSN"),
    (143, "IMAP"),
    (161, "SNMP"),
    (162, "SNMP-Trap"),
    (179, "BGP"),
    (389, "LDAP"),
    (443, "HTTPS"),
    (445, "SMB"),
    (465, "SMTPS"),
    (514, "Syslog"),
    (515, "LPD"),
    (587, "SMTP-Submission"),
    (631, "IPP"),
    (636, "LDAPS"),
    (873, "Rsync"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (1080, "SOCKS"),
    (1194, "OpenVPN"),
    (1433, "MSSQL"),
    (1521, "Oracle"),
    (1723, "PPTP"),
    (1883, "MQTT"),
    (2049, "NFS"),
    (2375, "Docker"),
    (3000, "Node.js-Dev"),
    (3128, "Squid"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5000, "Flask-Dev"),
    (5432, "PostgreSQL"),
    (5672, "AMQP"),
    (5900, "VNC"),
    (5901, "VNC-1"),
    (5985, "WinRM"),
    (6379, "Redis"),
    (8000, "HTTP-Alt"),
    (8080, "HTTP-Proxy"),
    (8443, "HTTPS-Alt"),
    (8888, "HTTP-Alt2"),
    (9092, "Kafka"),
    (9200, "Elasticsearch"),
    (9300, "Elasticsearch-Node"),
    (11211, "Memcached"),
    (27017, "MongoDB"),
    (27018, "MongoDB-Shard"),
];

/// Best-effort service label for a port; `unknown` when the port is not in the table.
pub fn service_label(port: u16) -> &'static str {
    WELL_KNOWN
        .binary_search_by_key(&port, |&(p, _)| p)
        .map(|i| WELL_KNOWN[i].1)
        .unwrap_or("unknown")
}

/// Parse an inclusive port range such as `1-1024` or a single port `22`.
pub fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let s = s.trim();
    let (start, end) = match s.split_once('-') {
        Some((a, b)) => (parse_port_str(a.trim())?, parse_port_str(b.trim())?),
        None => {
            let p = parse_port_str(s)?;
            (p, p)
        }
    };
    validate_range(start, end)?;
    Ok((start, end))
}

/// Reject empty or inverted ranges and port 0.
pub fn validate_range(start: u16, end: u16) -> Result<()> {
    if start == 0 {
        return Err(EngineError::InvalidArgument(
            "start port must be between 1 and 65535".into(),
        ));
    }
    if start > end {
        return Err(EngineError::InvalidArgument(format!(
            "invalid range {start}-{end} (start > end)"
        )));
    }
    Ok(())
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s
        .parse::<u32>()
        .map_err(|e| EngineError::InvalidArgument(format!("invalid port value {s:?}: {e}")))?;
    if val == 0 || val > 65535 {
        return Err(EngineError::InvalidArgument(format!(
            "port out of range: {val}"
        )));
    }
    Ok(val as u16)
}
