use crate::eui::Eui64;

const PREFIX: &str = "gateway";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Rx,
    Stats,
    Tx,
    Ack,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Rx => "rx",
            Category::Stats => "stats",
            Category::Tx => "tx",
            Category::Ack => "ack",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "rx" => Some(Category::Rx),
            "stats" => Some(Category::Stats),
            "tx" => Some(Category::Tx),
            "ack" => Some(Category::Ack),
            _ => None,
        }
    }
}

/// `gateway/<mac>/<category>`
pub fn topic(mac: Eui64, category: Category) -> String {
    format!("{PREFIX}/{mac}/{}", category.as_str())
}

pub fn parse(topic: &str) -> Option<(Eui64, Category)> {
    let mut segments = topic.split('/');
    if segments.next()? != PREFIX {
        return None;
    }
    let mac = segments.next()?.parse().ok()?;
    let category = Category::from_segment(segments.next()?)?;
    if segments.next().is_some() {
        return None;
    }
    Some((mac, category))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GW: Eui64 = Eui64::new([0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0xab, 0xcd]);

    #[test]
    fn names_are_stable() {
        assert_eq!(topic(GW, Category::Rx), "gateway/008000000000abcd/rx");
        assert_eq!(topic(GW, Category::Stats), "gateway/008000000000abcd/stats");
        assert_eq!(topic(GW, Category::Tx), "gateway/008000000000abcd/tx");
        assert_eq!(topic(GW, Category::Ack), "gateway/008000000000abcd/ack");
    }

    #[test]
    fn distinct_gateways_never_share_topics() {
        let other = Eui64::new([0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0xab, 0xce]);
        for category in [Category::Rx, Category::Stats, Category::Tx, Category::Ack] {
            assert_ne!(topic(GW, category), topic(other, category));
            assert_eq!(parse(&topic(other, category)), Some((other, category)));
        }
    }

    #[test]
    fn rejects_foreign_topics() {
        for bad in [
            "",
            "gateway",
            "gateway/008000000000abcd",
            "gateway/008000000000abcd/down",
            "gateway/008000000000abcd/tx/extra",
            "gateway/0080/tx",
            "gateway/zz80000000000bcd/tx",
            "application/008000000000abcd/tx",
        ] {
            assert_eq!(parse(bad), None, "{bad}");
        }
    }
}
