/// Service categories offered in the listing form
pub const SERVICES: &[&str] = &[
    "أعمال سباكة",
    "أعمال كهرباء",
    "دهان وديكور",
    "تنظيف منازل",
    "صيانة مكيفات",
    "نجارة والمنيوم",
    "صيانة عامة",
    "تركيب أثاث",
    "نقل عفش",
    "حدادة وألمنيوم",
];

/// Provinces and their districts
pub const REGIONS: &[(&str, &[&str])] = &[
    (
        "عمان",
        &[
            "قصبة عمان", "لواء ماركا", "لواء القويسمة", "لواء الجامعي", "لواء وادي السير", "لواء ناعور",
            "لواء سحاب", "لواء الجيزة", "لواء الموقر", "تلاع العلي", "خلدا", "عبدون", "الصويفية",
            "الشميساني", "جبل الحسين", "شفا بدران", "أبو نصير",
        ],
    ),
    (
        "إربد",
        &[
            "قصبة إربد", "لواء بني كنانة", "لواء الرمثا", "لواء الكورة", "لواء بني عبيد",
            "لواء المزار الشمالي", "لواء الطيبة", "لواء الوسطية", "لواء الأغوار الشمالية",
        ],
    ),
    ("الزرقاء", &["قصبة الزرقاء", "لواء الرصيفة", "لواء الهاشمية", "المنطقة الحرة", "بيرين", "الظليل"]),
    (
        "البلقاء",
        &["قصبة السلط", "لواء ماحص وفحيص", "لواء عين الباشا", "لواء الشونة الجنوبية", "لواء دير علا", "زي", "علان"],
    ),
    ("مادبا", &["قصبة مادبا", "لواء ذيبان", "ماعين", "الفيصلية"]),
    (
        "الكرك",
        &[
            "قصبة الكرك", "لواء المزار الجنوبي", "لواء القصر", "لواء الأغوار الجنوبية", "لواء عي", "لواء فقوع",
            "لواء القطرانة",
        ],
    ),
    ("معان", &["قصبة معان", "لواء البتراء", "لواء الشوبك", "لواء الحسينية", "إذرح"]),
    ("العقبة", &["قصبة العقبة", "لواء القويرة", "وادي رم", "الديسة"]),
    ("جرش", &["قصبة جرش", "المصطبة", "برما", "الكتة", "سوف"]),
    ("عجلون", &["قصبة عجلون", "لواء كفرنجة", "صخرة", "عبين وعبلين"]),
    ("المفرق", &["قصبة المفرق", "لواء الرويشد", "لواء البادية الشمالية", "لواء البادية الغربية", "بلعما"]),
    ("الطفيلة", &["قصبة الطفيلة", "لواء بصيرا", "لواء الحسا", "العين البيضاء"]),
];

pub fn provinces() -> impl Iterator<Item = &'static str> {
    REGIONS.iter().map(|(province, _)| *province)
}

/// Districts of a province, empty for an unknown province
pub fn areas_for(province: &str) -> &'static [&'static str] {
    REGIONS
        .iter()
        .find(|(p, _)| *p == province)
        .map(|(_, areas)| *areas)
        .unwrap_or(&[])
}
